use thiserror::Error;

use crate::{
    core::response::ResponseCode,
    ports::{cipher::CipherError, http_client::HttpClientError, rate_limit_store::StoreError},
};

/// Errors raised inside the request pipeline. Each one aborts the remaining
/// filter chain and is turned into a response via [`GatewayError::response_code`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("request is missing the uniqueId header")]
    MissingUniqueId,

    #[error("service definition not found: {unique_id}")]
    ServiceDefinitionNotFound { unique_id: String },

    #[error("no rule matches path {path} for service {service_id}")]
    PathNotMatched { service_id: String, path: String },

    #[error("no instance available for service {unique_id} (gray: {gray})")]
    NoInstanceAvailable { unique_id: String, gray: bool },

    #[error("flow control rejected request for key {key}")]
    FlowControlRejected { key: String },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid config for filter {filter_id}: {message}")]
    FilterConfig { filter_id: String, message: String },

    #[error("rate limit store failure: {0}")]
    Store(#[from] StoreError),

    #[error("payload decryption failed: {0}")]
    Cipher(#[from] CipherError),

    #[error("downstream call failed: {0}")]
    Downstream(#[from] HttpClientError),

    #[error("internal gateway error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn filter_config(filter_id: &str, message: impl ToString) -> Self {
        Self::FilterConfig {
            filter_id: filter_id.to_string(),
            message: message.to_string(),
        }
    }

    pub fn response_code(&self) -> ResponseCode {
        match self {
            Self::MissingUniqueId => ResponseCode::MissingUniqueId,
            Self::ServiceDefinitionNotFound { .. } => ResponseCode::ServiceDefinitionNotFound,
            Self::PathNotMatched { .. } => ResponseCode::PathNotMatched,
            Self::NoInstanceAvailable { .. } => ResponseCode::ServiceInstanceNotFound,
            Self::FlowControlRejected { .. } => ResponseCode::FlowControlRejected,
            Self::Unauthorized(_) => ResponseCode::Unauthorized,
            Self::FilterConfig { .. } | Self::Cipher(_) => ResponseCode::FilterConfigParseError,
            Self::Store(_) | Self::Internal(_) => ResponseCode::InternalError,
            Self::Downstream(HttpClientError::Timeout(_)) => ResponseCode::RequestTimeout,
            Self::Downstream(_) => ResponseCode::HttpResponseError,
        }
    }
}

/// Result alias used throughout the pipeline.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downstream_timeout_maps_to_request_timeout() {
        let err = GatewayError::from(HttpClientError::Timeout(3000));
        assert_eq!(err.response_code(), ResponseCode::RequestTimeout);

        let err = GatewayError::from(HttpClientError::ConnectionError("refused".into()));
        assert_eq!(err.response_code(), ResponseCode::HttpResponseError);
    }

    #[test]
    fn routing_errors_are_not_found() {
        let err = GatewayError::PathNotMatched {
            service_id: "user".into(),
            path: "/x".into(),
        };
        assert_eq!(err.response_code().status(), http::StatusCode::NOT_FOUND);
    }
}
