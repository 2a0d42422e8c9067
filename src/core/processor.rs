//! Per-request entry point run on the dispatch workers.

use std::{
    net::SocketAddr,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use bytes::Bytes;
use http::request::Parts;
use tokio::runtime::Handle;
use tracing::Instrument;

use crate::core::{
    chain::FilterChainFactory,
    context::{GatewayContext, ResponseSink},
    dispatch::{DispatchError, EventListener},
    error::{GatewayError, GatewayResult},
    request::GatewayRequest,
    response::{GatewayResponse, ResponseCode},
    store::DynamicConfigStore,
};

pub const ACCESS_LOG_TARGET: &str = "gatehouse::access";

/// An inbound request handed from the transport to a worker.
pub struct HttpRequestWrapper {
    parts: Parts,
    body: Bytes,
    peer: Option<SocketAddr>,
    sink: ResponseSink,
}

impl HttpRequestWrapper {
    pub fn new(parts: Parts, body: Bytes, peer: Option<SocketAddr>, sink: ResponseSink) -> Self {
        Self {
            parts,
            body,
            peer,
            sink,
        }
    }

    pub fn sink(&self) -> &ResponseSink {
        &self.sink
    }
}

/// Builds the context of each request and runs its filter chain.
pub struct GatewayProcessor {
    store: Arc<DynamicConfigStore>,
    chains: Arc<FilterChainFactory>,
    runtime: Handle,
}

impl GatewayProcessor {
    pub fn new(store: Arc<DynamicConfigStore>, chains: Arc<FilterChainFactory>, runtime: Handle) -> Self {
        Self {
            store,
            chains,
            runtime,
        }
    }

    pub async fn process(&self, wrapper: HttpRequestWrapper) {
        let HttpRequestWrapper {
            parts,
            body,
            peer,
            sink,
        } = wrapper;

        let request = match GatewayRequest::from_parts(&parts, body, peer) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(path = %parts.uri.path(), error = %e, "Rejecting request");
                sink.send(GatewayResponse::from_code(e.response_code()).into_http(true));
                return;
            }
        };

        let span = tracing::info_span!(
            "gateway_request",
            unique_id = %request.unique_id(),
            method = %request.method(),
            path = %request.path()
        );
        self.run(request, sink).instrument(span).await;
    }

    async fn run(&self, request: GatewayRequest, sink: ResponseSink) {
        let keep_alive = request.keep_alive();
        let ctx = match self.build_context(request, sink.clone()).await {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::warn!(error = %e, "No route for request");
                sink.send(GatewayResponse::from_code(e.response_code()).into_http(keep_alive));
                return;
            }
        };
        ctx.on_completed(Box::new(log_access));

        let chain = self.chains.build_chain(ctx.rule()).await;
        if let Err(e) = chain.execute(&ctx).await {
            ctx.set_error(e);
            ctx.write_response();
        }

        if ctx.is_terminated() && !ctx.is_responded() {
            // Short-circuited without a written response.
            let response = ctx
                .response()
                .unwrap_or_else(|| GatewayResponse::from_code(ResponseCode::InternalError));
            ctx.respond_directly(response);
        }
    }

    async fn build_context(
        &self,
        request: GatewayRequest,
        sink: ResponseSink,
    ) -> GatewayResult<Arc<GatewayContext>> {
        let definition = self
            .store
            .service_definition(request.unique_id())
            .await
            .ok_or_else(|| GatewayError::ServiceDefinitionNotFound {
                unique_id: request.unique_id().to_string(),
            })?;
        let rule = self.store.match_rule(&definition.service_id, request.path())?;
        Ok(GatewayContext::new(request, rule, sink))
    }
}

impl EventListener<HttpRequestWrapper> for GatewayProcessor {
    fn on_event(&self, event: HttpRequestWrapper) {
        let sink = event.sink.clone();
        let outcome = catch_unwind(AssertUnwindSafe(|| self.runtime.block_on(self.process(event))));
        if outcome.is_err() {
            tracing::error!("Request processing panicked");
            sink.send(GatewayResponse::from_code(ResponseCode::InternalError).into_http(true));
        }
    }

    fn on_exception(&self, error: DispatchError, event: HttpRequestWrapper) {
        tracing::warn!(error = %error, path = %event.parts.uri.path(), "Request not dispatched");
        event
            .sink
            .send(GatewayResponse::from_code(ResponseCode::ServiceUnavailable).into_http(true));
    }
}

fn log_access(ctx: &GatewayContext) {
    let (status, body_size) = ctx
        .response()
        .map_or((0, 0), |r| (r.status().as_u16(), r.body().len()));
    let latency_ms = u64::try_from(ctx.started().elapsed().as_millis()).unwrap_or(u64::MAX);
    ctx.with_request(|request| {
        tracing::info!(
            target: ACCESS_LOG_TARGET,
            latency_ms,
            client_ip = %request.client_ip(),
            unique_id = %request.unique_id(),
            method = %request.method(),
            path = %request.path(),
            status,
            body_size,
            retries = ctx.retry_count(),
            "request completed"
        );
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::{Request, StatusCode};

    use super::*;
    use crate::core::{
        chain::DEFAULT_CHAIN_TTL,
        filters::FilterRegistry,
        model::{Rule, ServiceDefinition},
    };

    async fn processor() -> GatewayProcessor {
        let store = Arc::new(DynamicConfigStore::new());
        store
            .put_service_definition(ServiceDefinition::new("user", "1.0"))
            .await;
        store.put_all_rules(vec![Rule {
            id: "r1".into(),
            service_id: "user".into(),
            prefix: "/user".into(),
            ..Rule::default()
        }]);
        // No router registered: the chain is empty.
        let chains = Arc::new(FilterChainFactory::new(
            Arc::new(FilterRegistry::new()),
            DEFAULT_CHAIN_TTL,
        ));
        GatewayProcessor::new(store, chains, Handle::current())
    }

    fn wrapper(uri: &str, unique_id: Option<&str>) -> (HttpRequestWrapper, tokio::sync::oneshot::Receiver<http::Response<axum::body::Body>>) {
        let mut builder = Request::builder().uri(uri);
        if let Some(id) = unique_id {
            builder = builder.header("uniqueId", id);
        }
        let (parts, _) = builder.body(()).unwrap().into_parts();
        let (sink, rx) = ResponseSink::channel();
        (HttpRequestWrapper::new(parts, Bytes::new(), None, sink), rx)
    }

    #[tokio::test]
    async fn missing_unique_id_is_bad_request() {
        let processor = processor().await;
        let (event, rx) = wrapper("/user/info", None);
        processor.process(event).await;
        assert_eq!(rx.await.unwrap().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_service_and_path_are_not_found() {
        let processor = processor().await;
        let (event, rx) = wrapper("/user/info", Some("order:1.0"));
        processor.process(event).await;
        assert_eq!(rx.await.unwrap().status(), StatusCode::NOT_FOUND);

        let (event, rx) = wrapper("/other", Some("user:1.0"));
        processor.process(event).await;
        assert_eq!(rx.await.unwrap().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rejected_dispatch_gets_service_unavailable() {
        let processor = processor().await;
        let (event, rx) = wrapper("/user/info", Some("user:1.0"));
        processor.on_exception(DispatchError::ShutDown, event);
        let response = tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
