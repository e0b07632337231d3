use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::core::context::Outcome;

/// Failures a request can run into on its way through the edge.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EdgeError {
    /// Admission control refused the request
    #[error("{message}")]
    AdmissionRejected {
        status: StatusCode,
        message: String,
        retry_after: Duration,
    },

    #[error("no route matches {method} {path}")]
    RouteNotFound { method: String, path: String },

    #[error("upstream for route '{route}' did not respond within {timeout:?} ({attempts} attempt(s))")]
    ForwardTimeout {
        route: String,
        timeout: Duration,
        attempts: u32,
    },

    #[error("upstream for route '{route}' is unreachable after {attempts} attempt(s): {reason}")]
    ForwardUnreachable {
        route: String,
        attempts: u32,
        reason: String,
    },

    #[error("bad request: {0}")]
    BadRequest(String),

    /// Span export failed. Absorbed by the export worker, never sent to clients.
    #[error("span export failed: {0}")]
    ExportFailure(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl EdgeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            EdgeError::AdmissionRejected { status, .. } => *status,
            EdgeError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            EdgeError::ForwardTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            EdgeError::ForwardUnreachable { .. } => StatusCode::BAD_GATEWAY,
            EdgeError::BadRequest(_) => StatusCode::BAD_REQUEST,
            EdgeError::ExportFailure(_) | EdgeError::ConfigInvalid(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn outcome(&self) -> Outcome {
        match self {
            EdgeError::AdmissionRejected { .. } => Outcome::Rejected,
            EdgeError::RouteNotFound { .. } => Outcome::NotFound,
            EdgeError::ForwardTimeout { .. } | EdgeError::ForwardUnreachable { .. } => {
                Outcome::ForwardFailed
            }
            EdgeError::BadRequest(_) => Outcome::BadRequest,
            EdgeError::ExportFailure(_) | EdgeError::ConfigInvalid(_) => Outcome::Fault,
        }
    }

    /// Short machine-readable kind, used as the `error.type` span tag.
    pub fn kind(&self) -> &'static str {
        match self {
            EdgeError::AdmissionRejected { .. } => "admission_rejected",
            EdgeError::RouteNotFound { .. } => "route_not_found",
            EdgeError::ForwardTimeout { .. } => "forward_timeout",
            EdgeError::ForwardUnreachable { .. } => "forward_unreachable",
            EdgeError::BadRequest(_) => "bad_request",
            EdgeError::ExportFailure(_) => "export_failure",
            EdgeError::ConfigInvalid(_) => "config_invalid",
        }
    }
}

/// Whole seconds for `Retry-After`, rounded up and never zero.
pub fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}

impl IntoResponse for EdgeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = match &self {
            EdgeError::AdmissionRejected { retry_after, .. } => Some(retry_after_secs(*retry_after)),
            _ => None,
        };
        // Internal details stay in logs; clients get the reason phrase.
        let body = match &self {
            EdgeError::AdmissionRejected { message, .. } => message.clone(),
            EdgeError::BadRequest(_) | EdgeError::RouteNotFound { .. } => self.to_string(),
            _ => status.canonical_reason().unwrap_or("Error").to_string(),
        };

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
