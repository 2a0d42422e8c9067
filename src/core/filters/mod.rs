//! Request filters and the registration table chains are built from.

pub mod auth;
pub mod crypto;
pub mod flow_control;
pub mod gray;
pub mod load_balance;
pub mod router;

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::{
    core::{
        context::GatewayContext,
        error::{GatewayError, GatewayResult},
        load_balancer::LoadBalancer,
        rate_limiter::RateLimiter,
    },
    ports::cipher::PayloadCipher,
};

pub use auth::AuthFilter;
pub use crypto::CryptoFilter;
pub use flow_control::FlowControlFilter;
pub use gray::GrayFilter;
pub use load_balance::LoadBalanceFilter;
pub use router::{CompletionMode, RouterFilter};

pub const AUTH_FILTER_ID: &str = "auth_filter";
pub const AUTH_FILTER_ORDER: i32 = 1;
pub const FLOW_CTL_FILTER_ID: &str = "flow_ctl_filter";
pub const FLOW_CTL_FILTER_ORDER: i32 = 10;
pub const GRAY_FILTER_ID: &str = "gray_filter";
pub const GRAY_FILTER_ORDER: i32 = 20;
pub const LOAD_BALANCE_FILTER_ID: &str = "load_balance_filter";
pub const LOAD_BALANCE_FILTER_ORDER: i32 = 100;
pub const CRYPTO_FILTER_ID: &str = "crypto_filter";
pub const CRYPTO_FILTER_ORDER: i32 = 200;
pub const ROUTER_FILTER_ID: &str = "router_filter";
pub const ROUTER_FILTER_ORDER: i32 = i32::MAX;

/// One step of a filter chain.
#[async_trait]
pub trait Filter: Send + Sync + 'static {
    /// Inspects or mutates the context. An error aborts the rest of the chain.
    async fn do_filter(&self, ctx: &Arc<GatewayContext>) -> GatewayResult<()>;
}

/// Registration metadata of a filter.
#[derive(Clone)]
pub struct FilterEntry {
    pub id: &'static str,
    pub name: &'static str,
    pub order: i32,
    pub filter: Arc<dyn Filter>,
}

impl FilterEntry {
    pub fn new(id: &'static str, name: &'static str, order: i32, filter: Arc<dyn Filter>) -> Self {
        Self {
            id,
            name,
            order,
            filter,
        }
    }
}

impl fmt::Debug for FilterEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterEntry")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("order", &self.order)
            .finish()
    }
}

/// Collaborators of the built-in filters.
pub struct StandardFilters {
    pub auth: AuthFilter,
    pub rate_limiter: Arc<RateLimiter>,
    pub balancer: Arc<LoadBalancer>,
    pub router: RouterFilter,
    pub cipher: Option<Arc<dyn PayloadCipher>>,
}

/// Every known filter indexed by id.
#[derive(Default, Debug)]
pub struct FilterRegistry {
    entries: HashMap<&'static str, FilterEntry>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in table. The crypto filter is only registered when a
    /// cipher is available.
    pub fn standard(filters: StandardFilters) -> Self {
        let mut registry = Self::new();
        registry
            .register(FilterEntry::new(
                AUTH_FILTER_ID,
                "auth",
                AUTH_FILTER_ORDER,
                Arc::new(filters.auth),
            ))
            .register(FilterEntry::new(
                FLOW_CTL_FILTER_ID,
                "flow control",
                FLOW_CTL_FILTER_ORDER,
                Arc::new(FlowControlFilter::new(filters.rate_limiter)),
            ))
            .register(FilterEntry::new(
                GRAY_FILTER_ID,
                "gray release",
                GRAY_FILTER_ORDER,
                Arc::new(GrayFilter),
            ))
            .register(FilterEntry::new(
                LOAD_BALANCE_FILTER_ID,
                "load balance",
                LOAD_BALANCE_FILTER_ORDER,
                Arc::new(LoadBalanceFilter::new(filters.balancer)),
            ))
            .register(FilterEntry::new(
                ROUTER_FILTER_ID,
                "router",
                ROUTER_FILTER_ORDER,
                Arc::new(filters.router),
            ));
        if let Some(cipher) = filters.cipher {
            registry.register(FilterEntry::new(
                CRYPTO_FILTER_ID,
                "payload decryption",
                CRYPTO_FILTER_ORDER,
                Arc::new(CryptoFilter::new(cipher)),
            ));
        }
        registry
    }

    /// Adds a filter, replacing any entry with the same id.
    pub fn register(&mut self, entry: FilterEntry) -> &mut Self {
        tracing::debug!(id = entry.id, order = entry.order, "Registering filter");
        self.entries.insert(entry.id, entry);
        self
    }

    pub fn get(&self, id: &str) -> Option<&FilterEntry> {
        self.entries.get(id)
    }

    pub fn router(&self) -> Option<&FilterEntry> {
        self.get(ROUTER_FILTER_ID)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parses a filter's JSON config. Blank config yields the default.
pub(crate) fn parse_filter_config<T>(filter_id: &str, raw: &str) -> GatewayResult<T>
where
    T: DeserializeOwned + Default,
{
    if raw.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(raw).map_err(|e| GatewayError::filter_config(filter_id, e))
}
