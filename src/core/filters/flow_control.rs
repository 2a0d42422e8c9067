use std::sync::Arc;

use async_trait::async_trait;

use super::Filter;
use crate::core::{
    context::GatewayContext,
    error::{GatewayError, GatewayResult},
    model::FlowControlType,
    rate_limiter::RateLimiter,
    store::path_key,
};

/// Applies every flow-control config of the rule that matches the request.
pub struct FlowControlFilter {
    limiter: Arc<RateLimiter>,
}

impl FlowControlFilter {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl Filter for FlowControlFilter {
    async fn do_filter(&self, ctx: &Arc<GatewayContext>) -> GatewayResult<()> {
        let rule = ctx.rule();
        if rule.flow_control_configs.is_empty() {
            return Ok(());
        }
        let path = ctx.with_request(|request| request.path().to_string());

        for config in &rule.flow_control_configs {
            let key = match config.kind {
                FlowControlType::Path if config.value == path => path_key(&rule.service_id, &path),
                FlowControlType::Service if config.value == rule.service_id => rule.service_id.clone(),
                _ => continue,
            };
            if !self.limiter.allow(config, &key).await? {
                tracing::info!(key = %key, "Flow control rejected request");
                return Err(GatewayError::FlowControlRejected { key });
            }
        }
        Ok(())
    }
}
