//! Assembly of the request pipeline from a [`GatewayConfig`].
//!
//! [`GatewayBuilder`] wires the store, limiter, balancer, filters, chain
//! cache, processor and dispatch queue together; the binary only adds the
//! listener, discovery and signal handling around the resulting [`Gateway`].

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{Router, body::Body as AxumBody, extract::ConnectInfo};
use eyre::{Result, WrapErr};
use hyper::Request;
use tokio::{runtime::Handle, task::JoinHandle};
use tower_http::trace::TraceLayer;

use crate::{
    adapters::{HttpClientAdapter, HttpHandler, InMemoryRateLimitStore},
    config::{ConfigValidator, models::GatewayConfig},
    core::{
        chain::FilterChainFactory,
        circuit_breaker::CommandRegistry,
        dispatch::ParallelQueue,
        filters::{AuthFilter, FilterRegistry, RouterFilter, StandardFilters},
        load_balancer::LoadBalancer,
        processor::{GatewayProcessor, HttpRequestWrapper},
        rate_limiter::RateLimiter,
        store::DynamicConfigStore,
    },
    ports::{
        cipher::PayloadCipher,
        discovery::{DiscoveryProvider, DiscoverySnapshot},
        http_client::HttpClient,
        rate_limit_store::RateLimitStore,
    },
    utils::{
        clock::{Clock, SystemClock},
        graceful_shutdown::ShutdownToken,
    },
};

/// Minimum spacing between two discovery reloads.
pub const RELOAD_DEBOUNCE: Duration = Duration::from_secs(2);

/// Collaborators that can be swapped out; anything left unset gets the
/// built-in adapter.
pub struct GatewayBuilder {
    config: GatewayConfig,
    client: Option<Arc<dyn HttpClient>>,
    rate_limit_store: Option<Arc<dyn RateLimitStore>>,
    clock: Option<Arc<dyn Clock>>,
    cipher: Option<Arc<dyn PayloadCipher>>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            client: None,
            rate_limit_store: None,
            clock: None,
            cipher: None,
        }
    }

    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn rate_limit_store(mut self, store: Arc<dyn RateLimitStore>) -> Self {
        self.rate_limit_store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Enables the crypto filter.
    pub fn cipher(mut self, cipher: Arc<dyn PayloadCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// Builds every component and starts the dispatch workers, which run
    /// request futures on `runtime`.
    pub fn build(self, runtime: Handle) -> Result<Gateway> {
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let client = self
            .client
            .unwrap_or_else(|| Arc::new(HttpClientAdapter::new(&config.http_client)));
        let limit_store = self
            .rate_limit_store
            .unwrap_or_else(|| Arc::new(InMemoryRateLimitStore::with_clock(clock.clone())));

        let store = Arc::new(DynamicConfigStore::new());
        let commands = Arc::new(CommandRegistry::new());
        let registry = FilterRegistry::standard(StandardFilters {
            auth: AuthFilter::new(
                config.auth.secret.as_bytes(),
                config.auth.cookie_name.clone(),
                config.auth.user_id_claim.clone(),
            ),
            rate_limiter: Arc::new(RateLimiter::new(limit_store, clock, &config.rate_limit)),
            balancer: Arc::new(LoadBalancer::new(store.clone())),
            router: RouterFilter::new(client, commands.clone(), config.completion_mode),
            cipher: self.cipher,
        });
        let chains = Arc::new(FilterChainFactory::new(
            Arc::new(registry),
            Duration::from_secs(config.filter_chain.cache_ttl_secs),
        ));

        let processor = Arc::new(GatewayProcessor::new(store.clone(), chains.clone(), runtime));
        let queue = ParallelQueue::<HttpRequestWrapper>::builder()
            .buffer_size(config.dispatch.buffer_size)
            .threads(config.dispatch.effective_worker_threads())
            .wait_strategy(config.dispatch.wait_strategy)
            .listener(processor)
            .build()
            .wrap_err("Invalid dispatch queue settings")?;
        queue.start().wrap_err("Failed to start dispatch workers")?;
        let queue = Arc::new(queue);

        let handler = Arc::new(HttpHandler::new(queue.clone(), config.max_content_length));
        tracing::info!(
            application = %config.application_name,
            env = %config.env,
            workers = config.dispatch.effective_worker_threads(),
            buffer_size = config.dispatch.buffer_size,
            "Gateway pipeline assembled"
        );

        Ok(Gateway {
            config: Arc::new(config),
            store,
            chains,
            commands,
            queue,
            handler,
        })
    }
}

/// A running pipeline: store, chain cache and the queue in front of them.
pub struct Gateway {
    config: Arc<GatewayConfig>,
    store: Arc<DynamicConfigStore>,
    chains: Arc<FilterChainFactory>,
    commands: Arc<CommandRegistry>,
    queue: Arc<ParallelQueue<HttpRequestWrapper>>,
    handler: Arc<HttpHandler>,
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    pub fn config(&self) -> &Arc<GatewayConfig> {
        &self.config
    }

    pub fn store(&self) -> &Arc<DynamicConfigStore> {
        &self.store
    }

    pub fn chains(&self) -> &Arc<FilterChainFactory> {
        &self.chains
    }

    pub fn commands(&self) -> &Arc<CommandRegistry> {
        &self.commands
    }

    pub fn handler(&self) -> &Arc<HttpHandler> {
        &self.handler
    }

    /// Validates and publishes a discovery snapshot, then drops cached
    /// chains so the next request sees the new rules. An invalid snapshot
    /// leaves the current state untouched.
    pub async fn apply_snapshot(&self, snapshot: DiscoverySnapshot) -> Result<u64> {
        ConfigValidator::validate_snapshot(&snapshot)
            .wrap_err("Rejected discovery snapshot")?;
        let rules = snapshot.rules.len();
        let services = snapshot.services.len();
        let version = self.store.apply_snapshot(snapshot).await;
        self.chains.purge().await;
        tracing::info!(version, rules, services, "Applied discovery snapshot");
        Ok(version)
    }

    /// Every path, every method goes through the pipeline.
    pub fn router(&self) -> Router {
        let handler = self.handler.clone();
        Router::new()
            .fallback(move |req: Request<AxumBody>| {
                let handler = handler.clone();
                async move {
                    let peer = req
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| *addr);
                    handler.handle_request(req, peer).await
                }
            })
            .layer(TraceLayer::new_for_http())
    }

    /// Stops the dispatch workers after they drain what is queued. Blocks,
    /// so call it off the async workers.
    pub fn shutdown(&self) {
        self.queue.shutdown();
    }
}

/// Loads the first snapshot from `provider` and applies it.
pub async fn load_initial_snapshot(
    gateway: &Gateway,
    provider: &dyn DiscoveryProvider,
) -> Result<u64> {
    let snapshot = provider
        .load_snapshot()
        .await
        .wrap_err("Failed to load initial discovery snapshot")?;
    gateway.apply_snapshot(snapshot).await
}

/// Reloads the snapshot whenever `provider` signals a change, at most once
/// per `debounce`, until `shutdown` fires or the provider stops watching.
pub fn spawn_discovery_watch(
    gateway: Arc<Gateway>,
    provider: Arc<dyn DiscoveryProvider>,
    mut shutdown: ShutdownToken,
    debounce: Duration,
) -> JoinHandle<()> {
    let mut changes = provider.watch();
    tokio::spawn(async move {
        tracing::info!("Discovery watcher started");
        let mut last_reload = tokio::time::Instant::now()
            .checked_sub(debounce)
            .unwrap_or_else(tokio::time::Instant::now);

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                change = changes.recv() => {
                    if change.is_none() {
                        break;
                    }
                }
            }

            let since = last_reload.elapsed();
            if since < debounce {
                // Wait out the window, then take every change since in one go.
                tokio::time::sleep(debounce - since).await;
            }
            while changes.try_recv().is_ok() {}
            last_reload = tokio::time::Instant::now();

            match provider.load_snapshot().await {
                Ok(snapshot) => {
                    if let Err(e) = gateway.apply_snapshot(snapshot).await {
                        tracing::error!("Keeping previous discovery state: {:?}", e);
                    }
                }
                Err(e) => tracing::error!("Failed to reload discovery snapshot: {:?}", e),
            }
        }
        tracing::info!("Discovery watcher stopped");
    })
}
