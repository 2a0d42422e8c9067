//! Last filter of every chain: calls the selected instance and completes
//! the context.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::Response;
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use super::Filter;
use crate::{
    core::{
        circuit_breaker::CommandRegistry,
        context::GatewayContext,
        error::{GatewayError, GatewayResult},
        model::HystrixConfig,
        request::GatewayRequest,
        response::GatewayResponse,
    },
    ports::http_client::HttpClient,
    tracing_setup::create_downstream_span,
};

/// Where the response is finalized once the downstream call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    /// On the task that awaited the call.
    #[default]
    SingleAsync,
    /// On a freshly spawned task.
    DoubleAsync,
}

pub struct RouterFilter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    client: Arc<dyn HttpClient>,
    commands: Arc<CommandRegistry>,
    completion: CompletionMode,
}

impl RouterFilter {
    pub fn new(
        client: Arc<dyn HttpClient>,
        commands: Arc<CommandRegistry>,
        completion: CompletionMode,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                client,
                commands,
                completion,
            }),
        }
    }
}

#[async_trait]
impl Filter for RouterFilter {
    async fn do_filter(&self, ctx: &Arc<GatewayContext>) -> GatewayResult<()> {
        let inner = self.inner.clone();
        let ctx = ctx.clone();
        tokio::spawn(inner.route(ctx).in_current_span());
        Ok(())
    }
}

impl RouterInner {
    async fn route(self: Arc<Self>, ctx: Arc<GatewayContext>) {
        let path = ctx.with_request(|request| request.path().to_string());
        let outcome = match ctx.rule().hystrix_config_for(&path) {
            Some(config) => Ok(self.call_with_command(&ctx, &path, config).await),
            None => self
                .call_with_retry(&ctx)
                .await
                .map(GatewayResponse::from_downstream),
        };

        match self.completion {
            CompletionMode::SingleAsync => complete(&ctx, outcome),
            CompletionMode::DoubleAsync => {
                tokio::spawn(async move { complete(&ctx, outcome) }.in_current_span());
            }
        }
    }

    async fn call_with_command(
        &self,
        ctx: &GatewayContext,
        path: &str,
        config: &HystrixConfig,
    ) -> GatewayResponse {
        let command = self
            .commands
            .command(&ctx.rule().service_id, path, config)
            .await;
        match command.execute(self.call_with_retry(ctx)).await {
            Ok(response) => GatewayResponse::from_downstream(response),
            Err(e) => {
                tracing::warn!(command = %command.key(), error = %e, "Downstream call fell back");
                let code = e.fallback_code();
                if config.fallback_response.is_empty() {
                    GatewayResponse::from_code(code)
                } else {
                    GatewayResponse::from_code_with_message(code, &config.fallback_response)
                }
            }
        }
    }

    /// Issues the call, retrying transient failures while the rule's retry
    /// budget lasts. Retries reuse the context and only redo this step.
    async fn call_with_retry(&self, ctx: &GatewayContext) -> GatewayResult<Response<Bytes>> {
        let budget = ctx.rule().retry_config.times;
        loop {
            let request = ctx.with_request(GatewayRequest::build_downstream)?;
            let attempt = ctx.retry_count() + 1;
            let span = ctx.with_request(|req| {
                create_downstream_span(
                    req.unique_id(),
                    req.modify_host().unwrap_or_default(),
                    attempt,
                )
            });
            match self.client.send_request(request).instrument(span).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && ctx.retry_count() < budget => {
                    let retry = ctx.increment_retry();
                    tracing::warn!(retry, budget, error = %e, "Retrying downstream call");
                }
                Err(e) => {
                    tracing::warn!(retries = ctx.retry_count(), error = %e, "Downstream call failed");
                    return Err(GatewayError::Downstream(e));
                }
            }
        }
    }
}

/// Stores the outcome and writes it back. When the regular write cannot
/// happen any more the response goes out directly, unless one already did.
fn complete(ctx: &GatewayContext, outcome: GatewayResult<GatewayResponse>) {
    let fallback = match outcome {
        Ok(response) => {
            ctx.set_response(response.clone());
            response
        }
        Err(e) => {
            let response = GatewayResponse::from_code(e.response_code());
            ctx.set_error(e);
            response
        }
    };
    if !ctx.write_response() && !ctx.is_responded() {
        tracing::debug!(status = ?ctx.status(), "Writing response outside the state machine");
        ctx.respond_directly(fallback);
    }
}
