//! Per-rule filter chains and their cache.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::core::{
    context::GatewayContext,
    error::GatewayResult,
    filters::{FilterEntry, FilterRegistry},
    model::Rule,
};

pub const DEFAULT_CHAIN_TTL: Duration = Duration::from_secs(10);

/// Filters of one rule, sorted ascending by order.
pub struct GatewayFilterChain {
    rule_id: String,
    filters: Vec<FilterEntry>,
}

impl GatewayFilterChain {
    pub fn new(rule_id: impl Into<String>, mut filters: Vec<FilterEntry>) -> Self {
        // Stable: equal orders keep their configured sequence.
        filters.sort_by_key(|entry| entry.order);
        Self {
            rule_id: rule_id.into(),
            filters,
        }
    }

    pub fn rule_id(&self) -> &str {
        &self.rule_id
    }

    pub fn filter_ids(&self) -> Vec<&'static str> {
        self.filters.iter().map(|entry| entry.id).collect()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Runs the filters in order. Stops quietly once the context is
    /// terminated and returns the first filter error.
    pub async fn execute(&self, ctx: &Arc<GatewayContext>) -> GatewayResult<()> {
        for entry in &self.filters {
            if ctx.is_terminated() {
                tracing::debug!(filter = entry.id, "Context terminated, stopping chain");
                break;
            }
            entry.filter.do_filter(ctx).await.inspect_err(|e| {
                tracing::warn!(filter = entry.id, rule = %self.rule_id, error = %e, "Filter failed");
            })?;
        }
        Ok(())
    }
}

impl fmt::Debug for GatewayFilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayFilterChain")
            .field("rule_id", &self.rule_id)
            .field("filters", &self.filter_ids())
            .finish()
    }
}

/// Builds chains from the registry and caches them per rule id.
pub struct FilterChainFactory {
    registry: Arc<FilterRegistry>,
    cache: scc::HashMap<String, (Arc<GatewayFilterChain>, Instant)>,
    ttl: Duration,
}

impl FilterChainFactory {
    pub fn new(registry: Arc<FilterRegistry>, ttl: Duration) -> Self {
        Self {
            registry,
            cache: scc::HashMap::new(),
            ttl,
        }
    }

    /// Chain for `rule`, served from the cache while the entry is fresh.
    pub async fn build_chain(&self, rule: &Rule) -> Arc<GatewayFilterChain> {
        if let Some((chain, built)) = self.cache.get_async(&rule.id).await.map(|e| e.get().clone()) {
            if built.elapsed() < self.ttl {
                return chain;
            }
        }

        let chain = Arc::new(self.do_build_chain(rule));
        tracing::debug!(rule = %rule.id, filters = ?chain.filter_ids(), "Built filter chain");
        let _ = self
            .cache
            .upsert_async(rule.id.clone(), (chain.clone(), Instant::now()))
            .await;
        chain
    }

    fn do_build_chain(&self, rule: &Rule) -> GatewayFilterChain {
        let mut filters: Vec<FilterEntry> = rule
            .filter_configs
            .iter()
            .filter_map(|config| {
                let entry = self.registry.get(&config.id);
                if entry.is_none() {
                    tracing::warn!(rule = %rule.id, filter = %config.id, "Unknown filter id, skipping");
                }
                entry
            })
            .filter(|entry| Some(entry.id) != self.registry.router().map(|r| r.id))
            .cloned()
            .collect();
        if let Some(router) = self.registry.router() {
            filters.push(router.clone());
        }
        GatewayFilterChain::new(rule.id.clone(), filters)
    }

    pub async fn invalidate(&self, rule_id: &str) {
        let _ = self.cache.remove_async(rule_id).await;
    }

    /// Drops every cached chain, e.g. after the rule set was replaced.
    pub async fn purge(&self) {
        self.cache.retain_async(|_, _| false).await;
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}
