use async_trait::async_trait;
use axum::body::Body as AxumBody;
use bytes::Bytes;
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for downstream HTTP calls
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Connection to the instance failed or was reset mid-flight
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Request did not complete within the configured timeout
    #[error("Timeout error after {0} ms")]
    Timeout(u64),

    /// Request could not be built or sent as given
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Response body could not be read
    #[error("Failed to read response body: {0}")]
    BodyError(String),
}

impl HttpClientError {
    /// Timeouts and I/O failures are worth another attempt; everything else is not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionError(_) | Self::Timeout(_) | Self::BodyError(_)
        )
    }
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for calling service instances
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send a request to an instance and read the full response body.
    ///
    /// Implementations enforce their own request timeout and report it as
    /// [`HttpClientError::Timeout`].
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<Bytes>>;
}
