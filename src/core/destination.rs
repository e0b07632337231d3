use std::{fmt, str::FromStr};

use http::{
    Uri,
    uri::{Authority, Scheme},
};
use thiserror::Error;

/// Errors related to destination addresses
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DestinationError {
    /// The address could not be parsed as a URI
    #[error("Invalid destination address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },
}

/// Result type for destination operations
pub type DestinationResult<T> = Result<T, DestinationError>;

/// A type-safe upstream address: scheme, authority and an optional base path.
///
/// `http://catalog.api:8080/v1/` is stored as scheme `http`, authority
/// `catalog.api:8080` and base path `/v1` (no trailing slash).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    scheme: Scheme,
    authority: Authority,
    base_path: String,
}

impl Destination {
    /// Parse an `http://` or `https://` address.
    pub fn new(address: &str) -> DestinationResult<Self> {
        let invalid = |reason: &str| DestinationError::InvalidAddress {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let uri: Uri = address.parse().map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;

        let scheme = uri.scheme().cloned().ok_or_else(|| invalid("missing scheme"))?;
        if scheme != Scheme::HTTP && scheme != Scheme::HTTPS {
            return Err(invalid("scheme must be http or https"));
        }

        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| invalid("missing host"))?;
        if authority.host().is_empty() {
            return Err(invalid("missing host"));
        }

        if uri.query().is_some() {
            return Err(invalid("destinations cannot carry a query string"));
        }

        let base_path = uri.path().trim_end_matches('/').to_string();

        Ok(Self {
            scheme,
            authority,
            base_path,
        })
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub fn host(&self) -> &str {
        self.authority.host()
    }

    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::HTTPS
    }

    /// Build the outbound URI for an already transformed path and the original query.
    pub fn uri_for(&self, path: &str, query: Option<&str>) -> Result<Uri, http::Error> {
        let mut path_and_query = String::with_capacity(self.base_path.len() + path.len() + 16);
        path_and_query.push_str(&self.base_path);
        if !path.starts_with('/') {
            path_and_query.push('/');
        }
        path_and_query.push_str(path);
        if let Some(query) = query {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }

        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
    }
}

impl FromStr for Destination {
    type Err = DestinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Destination::new(s)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority, self.base_path)
    }
}
