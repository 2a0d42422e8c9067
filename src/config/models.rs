//! Configuration data structures for the gateway.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files and to
//! `GATEHOUSE__SECTION__KEY` environment variables. Every section has defaults so
//! that an empty file yields a runnable gateway.
use serde::{Deserialize, Serialize};

use crate::core::{dispatch::WaitStrategy, filters::CompletionMode};

fn default_listen_addr() -> String {
    "0.0.0.0:8888".to_string()
}

fn default_application_name() -> String {
    "api-gateway".to_string()
}

fn default_env() -> String {
    "dev".to_string()
}

/// 64 MiB
fn default_max_content_length() -> usize {
    64 * 1024 * 1024
}

/// Top-level gateway configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address the HTTP ingress binds to
    pub listen_addr: String,
    pub application_name: String,
    /// Deployment environment label
    pub env: String,
    /// Largest accepted request body, in bytes
    pub max_content_length: usize,
    pub dispatch: DispatchConfig,
    pub http_client: HttpClientConfig,
    /// Where downstream completions are finalized
    pub completion_mode: CompletionMode,
    pub filter_chain: FilterChainConfig,
    pub rate_limit: RateLimitSettings,
    pub auth: AuthConfig,
    pub discovery: DiscoveryConfig,
    pub log: LogConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            application_name: default_application_name(),
            env: default_env(),
            max_content_length: default_max_content_length(),
            dispatch: DispatchConfig::default(),
            http_client: HttpClientConfig::default(),
            completion_mode: CompletionMode::default(),
            filter_chain: FilterChainConfig::default(),
            rate_limit: RateLimitSettings::default(),
            auth: AuthConfig::default(),
            discovery: DiscoveryConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Ingress dispatch queue settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Worker threads; 0 means one per available core
    pub worker_threads: usize,
    /// Buffer capacity, must be a power of two
    pub buffer_size: usize,
    pub wait_strategy: WaitStrategy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            buffer_size: 16 * 1024,
            wait_strategy: WaitStrategy::default(),
        }
    }
}

impl DispatchConfig {
    pub fn effective_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        } else {
            self.worker_threads
        }
    }
}

/// Outbound HTTP client settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct HttpClientConfig {
    pub connect_timeout_ms: u64,
    /// Hard deadline for one downstream attempt
    pub request_timeout_ms: u64,
    pub max_idle_per_host: usize,
    pub idle_timeout_ms: u64,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            request_timeout_ms: 30_000,
            max_idle_per_host: 8000,
            idle_timeout_ms: 60_000,
        }
    }
}

/// Filter chain cache settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct FilterChainConfig {
    pub cache_ttl_secs: u64,
}

impl Default for FilterChainConfig {
    fn default() -> Self {
        Self { cache_ttl_secs: 10 }
    }
}

/// What a distributed limiter decides when its store is unreachable
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Let the request through
    #[default]
    FailOpen,
    /// Reject the request
    FailClosed,
}

/// Rate limiter settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitSettings {
    pub on_store_error: StoreFailurePolicy,
    /// Attempts to take the fixed-window lock before denying
    pub lock_attempts: u32,
    pub lock_retry_delay_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            on_store_error: StoreFailurePolicy::default(),
            lock_attempts: 3,
            lock_retry_delay_ms: 5,
        }
    }
}

/// Token verification settings for the auth filter
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 shared secret
    pub secret: String,
    pub cookie_name: String,
    pub user_id_claim: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            cookie_name: crate::core::filters::auth::DEFAULT_COOKIE_NAME.to_string(),
            user_id_claim: crate::core::filters::auth::DEFAULT_USER_ID_CLAIM.to_string(),
        }
    }
}

/// Discovery document location
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// File with rules and services; watched for changes
    pub path: Option<String>,
}

/// Logging configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    /// JSON output instead of human-readable lines
    pub json: bool,
    /// Include span context in log events
    pub include_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            include_spans: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:8888");
        assert_eq!(config.dispatch.buffer_size, 16384);
        assert_eq!(config.dispatch.wait_strategy, WaitStrategy::Blocking);
        assert_eq!(config.completion_mode, CompletionMode::SingleAsync);
        assert_eq!(config.rate_limit.on_store_error, StoreFailurePolicy::FailOpen);
        assert_eq!(config.auth.cookie_name, "gateway-jwt");
        assert!(config.dispatch.effective_worker_threads() >= 1);
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: GatewayConfig = serde_json::from_value(serde_json::json!({
            "dispatch": {"wait_strategy": "busy_spin"},
            "completion_mode": "double_async",
            "rate_limit": {"on_store_error": "fail_closed"}
        }))
        .unwrap();
        assert_eq!(config.dispatch.wait_strategy, WaitStrategy::BusySpin);
        assert_eq!(config.dispatch.buffer_size, 16384);
        assert_eq!(config.completion_mode, CompletionMode::DoubleAsync);
        assert_eq!(config.rate_limit.on_store_error, StoreFailurePolicy::FailClosed);
        assert_eq!(config.rate_limit.lock_attempts, 3);
    }
}
