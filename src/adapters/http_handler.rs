use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::Body as AxumBody,
    http::{StatusCode, header},
};
use hyper::{Request, Response};

use crate::core::{
    context::ResponseSink,
    dispatch::ParallelQueue,
    processor::HttpRequestWrapper,
    response::{GatewayResponse, ResponseCode},
};

/// Transport side of the gateway: reads the request, hands it to the
/// dispatch queue and waits for the pipeline to answer.
pub struct HttpHandler {
    queue: Arc<ParallelQueue<HttpRequestWrapper>>,
    max_content_length: usize,
    response_timeout: Option<Duration>,
}

impl HttpHandler {
    pub fn new(queue: Arc<ParallelQueue<HttpRequestWrapper>>, max_content_length: usize) -> Self {
        Self {
            queue,
            max_content_length,
            response_timeout: None,
        }
    }

    /// Upper bound on waiting for the pipeline; unbounded by default.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    pub async fn handle_request(
        &self,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> Response<AxumBody> {
        let (parts, body) = req.into_parts();
        let body = match axum::body::to_bytes(body, self.max_content_length).await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(path = %parts.uri.path(), error = %e, "Rejecting request body");
                return Self::plain(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
            }
        };

        let (sink, receiver) = ResponseSink::channel();
        let wrapper = HttpRequestWrapper::new(parts, body, client_addr, sink);
        if self.queue.try_submit(wrapper).is_err() {
            tracing::warn!(
                pending = self.queue.len(),
                "Dispatch queue full or stopped, rejecting request"
            );
            return GatewayResponse::from_code(ResponseCode::ServiceUnavailable).into_http(true);
        }

        let outcome = match self.response_timeout {
            Some(limit) => match tokio::time::timeout(limit, receiver).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!("Pipeline did not answer in time");
                    return GatewayResponse::from_code(ResponseCode::RequestTimeout).into_http(true);
                }
            },
            None => receiver.await,
        };
        outcome.unwrap_or_else(|_| {
            tracing::error!("Pipeline dropped the request without a response");
            GatewayResponse::from_code(ResponseCode::InternalError).into_http(true)
        })
    }

    fn plain(status: StatusCode, message: &'static str) -> Response<AxumBody> {
        let mut response = Response::new(AxumBody::from(message));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, header::HeaderValue::from_static("text/plain"));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dispatch::{DispatchError, EventListener};

    /// Answers every request with success.
    struct Echo;

    impl EventListener<HttpRequestWrapper> for Echo {
        fn on_event(&self, event: HttpRequestWrapper) {
            event
                .sink()
                .send(GatewayResponse::from_code(ResponseCode::Success).into_http(true));
        }

        fn on_exception(&self, _error: DispatchError, event: HttpRequestWrapper) {
            event
                .sink()
                .send(GatewayResponse::from_code(ResponseCode::ServiceUnavailable).into_http(true));
        }
    }

    fn queue(buffer: usize, start: bool) -> Arc<ParallelQueue<HttpRequestWrapper>> {
        let queue = ParallelQueue::builder()
            .buffer_size(buffer)
            .threads(1)
            .listener(Arc::new(Echo))
            .build()
            .unwrap();
        if start {
            queue.start().unwrap();
        }
        Arc::new(queue)
    }

    fn request(body: &'static str) -> Request<AxumBody> {
        Request::builder()
            .uri("/user/info")
            .header("uniqueId", "user:1.0")
            .body(AxumBody::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn request_round_trips_through_queue() {
        let handler = HttpHandler::new(queue(4, true), 1024);
        let response = handler.handle_request(request("{}"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let handler = HttpHandler::new(queue(4, true), 4);
        let response = handler.handle_request(request("too large"), None).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn full_queue_is_service_unavailable() {
        // Not started: the single slot fills up and stays full.
        let queue = queue(1, false);
        let handler = Arc::new(
            HttpHandler::new(queue.clone(), 1024).with_response_timeout(Duration::from_millis(50)),
        );
        let first = {
            let handler = handler.clone();
            tokio::spawn(async move { handler.handle_request(request(""), None).await })
        };
        while queue.is_empty() {
            tokio::task::yield_now().await;
        }

        let response = handler.handle_request(request(""), None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(first.await.unwrap().status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
