use std::{net::SocketAddr, time::Instant};

use axum::body::Body as AxumBody;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, header, request::Parts};

use crate::core::error::{GatewayError, GatewayResult};

/// Header carrying the `serviceId:version` the caller wants to reach.
pub const UNIQUE_ID_HEADER: &str = "uniqueid";
/// Header forwarded downstream once the auth filter resolved a user.
pub const USER_ID_HEADER: &str = "x-user-id";
const FORWARDED_FOR: &str = "x-forwarded-for";

/// Inbound request plus the parts filters rewrite before the downstream call.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    unique_id: String,
    received_at: Instant,
    method: Method,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
    client_ip: String,
    keep_alive: bool,

    modify_scheme: &'static str,
    modify_host: Option<String>,
    modify_path: Option<String>,
    modify_query: Option<String>,
    user_id: Option<String>,
}

impl GatewayRequest {
    /// Builds the request from transport parts. Fails without a `uniqueId` header.
    pub fn from_parts(parts: &Parts, body: Bytes, peer: Option<SocketAddr>) -> GatewayResult<Self> {
        let unique_id = parts
            .headers
            .get(UNIQUE_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(GatewayError::MissingUniqueId)?
            .to_string();

        let keep_alive = match parts.headers.get(header::CONNECTION).and_then(|v| v.to_str().ok()) {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            _ => parts.version >= http::Version::HTTP_11,
        };

        Ok(Self {
            unique_id,
            received_at: Instant::now(),
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(str::to_string),
            headers: parts.headers.clone(),
            body,
            client_ip: client_ip(&parts.headers, peer),
            keep_alive,
            modify_scheme: "http",
            modify_host: None,
            modify_path: None,
            modify_query: None,
            user_id: None,
        })
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Value of a cookie from the `Cookie` header(s).
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }

    pub fn modify_host(&self) -> Option<&str> {
        self.modify_host.as_deref()
    }

    pub fn set_modify_host(&mut self, host: impl Into<String>) {
        self.modify_host = Some(host.into());
    }

    pub fn set_modify_path(&mut self, path: impl Into<String>) {
        self.modify_path = Some(path.into());
    }

    pub fn set_modify_query(&mut self, query: impl Into<String>) {
        self.modify_query = Some(query.into());
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn set_user_id(&mut self, user_id: impl Into<String>) {
        self.user_id = Some(user_id.into());
    }

    /// Final downstream URL: rewritten host, path and query when set.
    pub fn downstream_url(&self) -> GatewayResult<String> {
        let host = self
            .modify_host
            .as_deref()
            .ok_or_else(|| GatewayError::Internal("no downstream instance selected".into()))?;
        let path = self.modify_path.as_deref().unwrap_or(&self.path);
        let mut url = format!("{}://{host}{path}", self.modify_scheme);
        if let Some(query) = self.modify_query.as_deref().or(self.query.as_deref()) {
            url.push('?');
            url.push_str(query);
        }
        Ok(url)
    }

    /// Builds the outbound request. Can be called once per attempt.
    pub fn build_downstream(&self) -> GatewayResult<Request<AxumBody>> {
        let url = self.downstream_url()?;
        let mut request = Request::builder()
            .method(self.method.clone())
            .uri(&url)
            .body(AxumBody::from(self.body.clone()))
            .map_err(|e| GatewayError::Internal(format!("invalid downstream request {url}: {e}")))?;

        let headers = request.headers_mut();
        for (name, value) in &self.headers {
            if name == header::HOST || name == header::CONTENT_LENGTH || name == header::CONNECTION {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        if let Some(host) = self.modify_host.as_deref().and_then(|h| HeaderValue::from_str(h).ok()) {
            headers.insert(header::HOST, host);
        }
        let forwarded = match self.header(FORWARDED_FOR) {
            Some(existing) => format!("{existing}, {}", self.client_ip),
            None => self.client_ip.clone(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            headers.insert(HeaderName::from_static(FORWARDED_FOR), value);
        }
        if let Some(user) = self.user_id.as_deref().and_then(|u| HeaderValue::from_str(u).ok()) {
            headers.insert(HeaderName::from_static(USER_ID_HEADER), user);
        }
        Ok(request)
    }
}

/// First `X-Forwarded-For` entry, falling back to the peer address.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get(FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(builder: http::request::Builder) -> Parts {
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn missing_unique_id_is_rejected() {
        let parts = parts(Request::builder().uri("/user/1"));
        let err = GatewayRequest::from_parts(&parts, Bytes::new(), None).unwrap_err();
        assert!(matches!(err, GatewayError::MissingUniqueId));
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let peer: SocketAddr = "192.168.1.9:5000".parse().unwrap();
        let forwarded = parts(
            Request::builder()
                .uri("/a")
                .header("uniqueId", "user:1.0")
                .header("X-Forwarded-For", "10.1.1.1, 10.2.2.2"),
        );
        let request = GatewayRequest::from_parts(&forwarded, Bytes::new(), Some(peer)).unwrap();
        assert_eq!(request.client_ip(), "10.1.1.1");
        assert_eq!(request.unique_id(), "user:1.0");

        let direct = parts(Request::builder().uri("/a").header("uniqueId", "user:1.0"));
        let request = GatewayRequest::from_parts(&direct, Bytes::new(), Some(peer)).unwrap();
        assert_eq!(request.client_ip(), "192.168.1.9");
    }

    #[test]
    fn cookies_are_parsed() {
        let parts = parts(
            Request::builder()
                .uri("/a")
                .header("uniqueId", "u:1")
                .header(header::COOKIE, "a=1; gateway-jwt=token; gray_release=true"),
        );
        let request = GatewayRequest::from_parts(&parts, Bytes::new(), None).unwrap();
        assert_eq!(request.cookie("gateway-jwt"), Some("token"));
        assert_eq!(request.cookie("missing"), None);
    }

    #[test]
    fn downstream_request_is_rewritten_to_instance() {
        let parts = parts(
            Request::builder()
                .method(Method::POST)
                .uri("http://gateway:8888/user/info?id=3")
                .header("uniqueId", "user:1.0")
                .header(header::HOST, "gateway:8888")
                .header(header::COOKIE, "a=1"),
        );
        let mut request =
            GatewayRequest::from_parts(&parts, Bytes::from_static(b"{}"), "127.0.0.1:1".parse().ok())
                .unwrap();
        assert!(request.build_downstream().is_err());

        request.set_modify_host("10.0.0.5:9000");
        request.set_user_id("42");
        let downstream = request.build_downstream().unwrap();

        assert_eq!(downstream.uri(), "http://10.0.0.5:9000/user/info?id=3");
        assert_eq!(downstream.method(), Method::POST);
        assert_eq!(downstream.headers()[header::HOST], "10.0.0.5:9000");
        assert_eq!(downstream.headers()[header::COOKIE], "a=1");
        assert_eq!(downstream.headers()[FORWARDED_FOR], "127.0.0.1");
        assert_eq!(downstream.headers()[USER_ID_HEADER], "42");
    }

    #[test]
    fn modified_path_and_query_take_precedence() {
        let parts = parts(Request::builder().uri("/pay/encrypt/xyz?a=1").header("uniqueId", "u:1"));
        let mut request = GatewayRequest::from_parts(&parts, Bytes::new(), None).unwrap();
        request.set_modify_host("h:1");
        request.set_modify_path("/pay");
        request.set_modify_query("amount=5");
        assert_eq!(request.downstream_url().unwrap(), "http://h:1/pay?amount=5");
    }
}
