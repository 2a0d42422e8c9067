use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{Filter, LOAD_BALANCE_FILTER_ID, parse_filter_config};
use crate::core::{
    context::GatewayContext,
    error::GatewayResult,
    load_balancer::{LoadBalanceStrategy, LoadBalancer},
};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoadBalanceConfig {
    #[serde(alias = "loadBalance")]
    load_balance: Option<String>,
}

/// Picks the downstream instance and rewrites the request host to it.
pub struct LoadBalanceFilter {
    balancer: Arc<LoadBalancer>,
}

impl LoadBalanceFilter {
    pub fn new(balancer: Arc<LoadBalancer>) -> Self {
        Self { balancer }
    }

    fn strategy(ctx: &GatewayContext) -> GatewayResult<LoadBalanceStrategy> {
        let Some(entry) = ctx.rule().filter_config(LOAD_BALANCE_FILTER_ID) else {
            return Ok(LoadBalanceStrategy::default());
        };
        let config: LoadBalanceConfig = parse_filter_config(LOAD_BALANCE_FILTER_ID, &entry.config)?;
        Ok(config
            .load_balance
            .as_deref()
            .map(LoadBalanceStrategy::parse)
            .unwrap_or_default())
    }
}

#[async_trait]
impl Filter for LoadBalanceFilter {
    async fn do_filter(&self, ctx: &Arc<GatewayContext>) -> GatewayResult<()> {
        let strategy = Self::strategy(ctx)?;
        let unique_id = ctx.with_request(|request| request.unique_id().to_string());
        let instance = self
            .balancer
            .choose(&unique_id, ctx.is_gray(), strategy)
            .await?;
        tracing::debug!(
            unique_id = %unique_id,
            instance = %instance.instance_id,
            ?strategy,
            "Instance selected"
        );
        ctx.with_request_mut(|request| request.set_modify_host(instance.address()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        error::GatewayError,
        model::{FilterConfig, Rule, ServiceInstance},
        store::DynamicConfigStore,
        test_support::context_with,
    };

    async fn filter() -> LoadBalanceFilter {
        let store = Arc::new(DynamicConfigStore::new());
        store
            .put_service_instances(
                "user:1.0",
                vec![
                    ServiceInstance::new("user:1.0", "10.0.0.1", 8080),
                    ServiceInstance::new("user:1.0", "10.0.0.2", 8080),
                ],
            )
            .await;
        LoadBalanceFilter::new(Arc::new(LoadBalancer::new(store)))
    }

    fn round_robin_rule() -> Rule {
        Rule {
            filter_configs: vec![FilterConfig::new(
                LOAD_BALANCE_FILTER_ID,
                r#"{"load_balance": "RoundRobin"}"#,
            )],
            ..Rule::default()
        }
    }

    #[tokio::test]
    async fn rewrites_host_round_robin() {
        let filter = filter().await;
        let mut hosts = Vec::new();
        for _ in 0..3 {
            let (ctx, _rx) = context_with("/user/info", &[], round_robin_rule());
            filter.do_filter(&ctx).await.unwrap();
            hosts.push(ctx.with_request(|r| r.modify_host().map(str::to_string)).unwrap());
        }
        assert_eq!(hosts, vec!["10.0.0.1:8080", "10.0.0.2:8080", "10.0.0.1:8080"]);
    }

    #[tokio::test]
    async fn gray_request_without_gray_instances_fails() {
        let filter = filter().await;
        let (ctx, _rx) = context_with("/user/info", &[], round_robin_rule());
        ctx.set_gray(true);
        let err = filter.do_filter(&ctx).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoInstanceAvailable { gray: true, .. }));
    }
}
