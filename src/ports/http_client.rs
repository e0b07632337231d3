use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for HTTP client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// The upstream could not be reached (DNS, refused, reset, TLS)
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The request could not be sent as built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for making HTTP requests to upstreams
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send a fully prepared request and resolve once the response head arrives.
    ///
    /// The response body is streamed; timeouts are applied by the caller.
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;
}
