//! Gatehouse - a rule-driven API gateway.
//!
//! Every inbound request is handed by the HTTP ingress to a bounded dispatch
//! queue, picked up by exactly one worker, matched to a routing rule and run
//! through that rule's filter chain. The chain authenticates, rate-limits,
//! tags gray traffic, picks a service instance, optionally decrypts the
//! payload and finally forwards the call downstream with bounded retries and
//! an optional circuit breaker.
//!
//! # Quick Example
//! ```no_run
//! use gatehouse::{Gateway, config::GatewayConfig};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let gateway = Gateway::builder(GatewayConfig::default())
//!     .build(tokio::runtime::Handle::current())?;
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8888").await?;
//! axum::serve(
//!     listener,
//!     gateway
//!         .router()
//!         .into_make_service_with_connect_info::<std::net::SocketAddr>(),
//! )
//! .await?;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! Traits for the outside world (downstream HTTP, rate-limit storage,
//! discovery, payload ciphers) live in `ports`; their implementations live in
//! `adapters`. The pipeline itself is in `core` and only talks to ports.
//!
//! # Error Handling
//! The request path uses the typed [`core::error::GatewayError`], which maps
//! onto a response code. Startup and configuration return `eyre::Result<T>`
//! with context attached through `WrapErr`.
//!
//! # Concurrency & Data Structures
//! Service definitions, instances and caches sit in `scc::HashMap`; the rule
//! set is published through `arc_swap::ArcSwap` and replaced as a whole.
pub mod config;
pub mod gateway;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{FileDiscoveryProvider, HttpClientAdapter, HttpHandler},
    gateway::{Gateway, GatewayBuilder},
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
