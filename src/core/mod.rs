pub mod chain;
pub mod circuit_breaker;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod filters;
pub mod load_balancer;
pub mod model;
pub mod processor;
pub mod rate_limiter;
pub mod request;
pub mod response;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

pub use chain::{FilterChainFactory, GatewayFilterChain};
pub use context::{ContextStatus, GatewayContext, ResponseSink};
pub use dispatch::{ParallelQueue, WaitStrategy};
pub use error::{GatewayError, GatewayResult};
pub use load_balancer::{LoadBalancer, LoadBalancerFactory};
pub use processor::{GatewayProcessor, HttpRequestWrapper};
pub use rate_limiter::RateLimiter;
pub use store::DynamicConfigStore;
