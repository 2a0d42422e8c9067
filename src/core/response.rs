use std::fmt;

use axum::body::Body as AxumBody;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Response, StatusCode, header};
use serde::Serialize;

/// Gateway response codes: the HTTP status the caller sees plus the
/// gateway-internal code carried in the JSON error body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ResponseCode {
    Success,
    Unauthorized,
    InternalError,
    ServiceUnavailable,
    MissingUniqueId,
    PathNotMatched,
    ServiceDefinitionNotFound,
    ServiceInvokerNotFound,
    ServiceInstanceNotFound,
    FilterConfigParseError,
    RequestTimeout,
    HttpResponseError,
    FlowControlRejected,
    FallbackTimeout,
    FallbackError,
}

impl ResponseCode {
    pub fn status(self) -> StatusCode {
        match self {
            Self::Success => StatusCode::OK,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InternalError
            | Self::FilterConfigParseError
            | Self::HttpResponseError
            | Self::FallbackError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::MissingUniqueId => StatusCode::BAD_REQUEST,
            Self::PathNotMatched
            | Self::ServiceDefinitionNotFound
            | Self::ServiceInvokerNotFound
            | Self::ServiceInstanceNotFound => StatusCode::NOT_FOUND,
            Self::RequestTimeout | Self::FallbackTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::FlowControlRejected => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Unauthorized => 401,
            Self::InternalError => 1000,
            Self::ServiceUnavailable => 2000,
            Self::MissingUniqueId => 10001,
            Self::PathNotMatched => 10002,
            Self::ServiceDefinitionNotFound => 10003,
            Self::ServiceInvokerNotFound => 10004,
            Self::ServiceInstanceNotFound => 10005,
            Self::FilterConfigParseError => 10006,
            Self::RequestTimeout => 10007,
            Self::HttpResponseError => 10030,
            Self::FlowControlRejected => 10040,
            Self::FallbackTimeout => 10055,
            Self::FallbackError => 10066,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Unauthorized => "user not logged in",
            Self::InternalError => "internal gateway error",
            Self::ServiceUnavailable => "service temporarily unavailable",
            Self::MissingUniqueId => "request header is missing uniqueId",
            Self::PathNotMatched => "no rule matches the request path",
            Self::ServiceDefinitionNotFound => "service definition not found",
            Self::ServiceInvokerNotFound => "service invoker not found",
            Self::ServiceInstanceNotFound => "no service instance available",
            Self::FilterConfigParseError => "filter configuration could not be parsed",
            Self::RequestTimeout => "downstream request timed out",
            Self::HttpResponseError => "downstream service returned an error",
            Self::FlowControlRejected => "too many requests",
            Self::FallbackTimeout => "request timed out, fallback applied",
            Self::FallbackError => "downstream call failed, fallback applied",
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: i32,
    message: &'a str,
}

/// Response held by a context between `Written` and `Completed`.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    code: Option<ResponseCode>,
}

impl GatewayResponse {
    /// JSON error body built from the code's own message.
    pub fn from_code(code: ResponseCode) -> Self {
        Self::from_code_with_message(code, code.message())
    }

    pub fn from_code_with_message(code: ResponseCode, message: &str) -> Self {
        let body = serde_json::to_vec(&ErrorBody {
            code: code.code(),
            message,
        })
        .unwrap_or_default();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        Self {
            status: code.status(),
            headers,
            body: Bytes::from(body),
            code: Some(code),
        }
    }

    /// Wraps a fully-read downstream response.
    pub fn from_downstream(response: Response<Bytes>) -> Self {
        let (parts, body) = response.into_parts();
        let mut headers = parts.headers;
        headers.remove(header::TRANSFER_ENCODING);
        headers.remove(header::CONNECTION);
        Self {
            status: parts.status,
            headers,
            body,
            code: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Gateway code for responses produced by the gateway itself.
    pub fn code(&self) -> Option<ResponseCode> {
        self.code
    }

    /// Converts into the transport response, fixing framing headers.
    pub fn into_http(self, keep_alive: bool) -> Response<AxumBody> {
        let mut response = Response::new(AxumBody::from(self.body.clone()));
        *response.status_mut() = self.status;
        let headers = response.headers_mut();
        headers.extend(self.headers);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(self.body.len()));
        headers.insert(
            header::CONNECTION,
            HeaderValue::from_static(if keep_alive { "keep-alive" } else { "close" }),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;

    #[test]
    fn codes_map_to_expected_statuses() {
        assert_eq!(ResponseCode::FlowControlRejected.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ResponseCode::FallbackTimeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ResponseCode::PathNotMatched.code(), 10002);
        assert_eq!(ResponseCode::FallbackError.code(), 10066);
    }

    #[tokio::test]
    async fn error_response_has_json_body_and_framing() {
        let response = GatewayResponse::from_code(ResponseCode::ServiceInstanceNotFound);
        assert_eq!(response.code(), Some(ResponseCode::ServiceInstanceNotFound));

        let http = response.into_http(false);
        assert_eq!(http.status(), StatusCode::NOT_FOUND);
        assert_eq!(http.headers()[header::CONNECTION], "close");

        let body = http.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["code"], 10005);
    }

    #[test]
    fn downstream_response_drops_hop_headers() {
        let downstream = Response::builder()
            .status(201)
            .header(header::TRANSFER_ENCODING, "chunked")
            .header("x-backend", "a")
            .body(Bytes::from_static(b"created"))
            .unwrap();
        let response = GatewayResponse::from_downstream(downstream);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(response.headers()["x-backend"], "a");
        assert!(response.code().is_none());
    }
}
