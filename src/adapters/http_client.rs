use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{Request, Response, Version, header};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use tokio::time::timeout;

use crate::{
    config::models::HttpClientConfig,
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
};

const USER_AGENT: &str = "gatehouse/0.1";

/// Pooled HTTP/1.1 client for calls to service instances.
///
/// Every call runs under the configured request timeout, which covers both
/// the response head and reading the full body.
pub struct HttpClientAdapter {
    client: Client<HttpConnector, AxumBody>,
    request_timeout: Duration,
}

impl HttpClientAdapter {
    pub fn new(config: &HttpClientConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_millis(config.connect_timeout_ms)));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(Duration::from_millis(config.idle_timeout_ms))
            .build(connector);

        tracing::info!(
            connect_timeout_ms = config.connect_timeout_ms,
            request_timeout_ms = config.request_timeout_ms,
            max_idle_per_host = config.max_idle_per_host,
            "Created downstream HTTP client"
        );
        Self {
            client,
            request_timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }

    fn add_common_headers(req: &mut Request<AxumBody>) {
        let headers = req.headers_mut();
        if !headers.contains_key(header::USER_AGENT) {
            headers.insert(header::USER_AGENT, header::HeaderValue::from_static(USER_AGENT));
        }
    }

    async fn send_and_collect(&self, req: Request<AxumBody>) -> HttpClientResult<Response<Bytes>> {
        let method = req.method().clone();
        let uri = req.uri().clone();

        let response = self.client.request(req).await.map_err(|e| {
            HttpClientError::ConnectionError(format!("Request to {method} {uri} failed: {e}"))
        })?;
        let (mut parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| HttpClientError::BodyError(e.to_string()))?
            .to_bytes();

        // The body is fully buffered; framing is decided on the way out.
        parts.headers.remove(header::TRANSFER_ENCODING);
        Ok(Response::from_parts(parts, body))
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(&self, mut req: Request<AxumBody>) -> HttpClientResult<Response<Bytes>> {
        if req.uri().host().is_none() {
            tracing::error!("Outgoing URI has no host: {}", req.uri());
            return Err(HttpClientError::InvalidRequest(
                "Outgoing URI has no host".to_string(),
            ));
        }
        Self::add_common_headers(&mut req);
        *req.version_mut() = Version::HTTP_11;

        tracing::debug!(method = %req.method(), uri = %req.uri(), "Sending downstream request");
        match timeout(self.request_timeout, self.send_and_collect(req)).await {
            Ok(Ok(response)) => {
                tracing::debug!(status = response.status().as_u16(), "Downstream responded");
                Ok(response)
            }
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Downstream request failed");
                Err(e)
            }
            Err(_) => {
                let ms = u64::try_from(self.request_timeout.as_millis()).unwrap_or(u64::MAX);
                Err(HttpClientError::Timeout(ms))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::{Router, routing::get};
    use tokio::net::TcpListener;

    use super::*;

    async fn spawn_backend() -> std::net::SocketAddr {
        let app = Router::new()
            .route("/ok", get(|| async { "hello" }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        addr
    }

    fn client(request_timeout_ms: u64) -> HttpClientAdapter {
        HttpClientAdapter::new(&HttpClientConfig {
            request_timeout_ms,
            connect_timeout_ms: 500,
            ..HttpClientConfig::default()
        })
    }

    fn get_request(uri: String) -> Request<AxumBody> {
        Request::builder().uri(uri).body(AxumBody::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_collects_response_body() {
        let addr = spawn_backend().await;
        let response = client(2000)
            .send_request(get_request(format!("http://{addr}/ok")))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.body().as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let addr = spawn_backend().await;
        let err = client(100)
            .send_request(get_request(format!("http://{addr}/slow")))
            .await
            .unwrap_err();
        assert_eq!(err, HttpClientError::Timeout(100));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_refused_connection_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(2000)
            .send_request(get_request(format!("http://{addr}/ok")))
            .await
            .unwrap_err();
        assert!(matches!(err, HttpClientError::ConnectionError(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_uri_without_host_is_invalid() {
        let err = client(2000)
            .send_request(get_request("/relative".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, HttpClientError::InvalidRequest(_)));
        assert!(!err.is_transient());
    }
}
