use std::{net::SocketAddr, path::Path, sync::Arc};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use gatehouse::{
    FileDiscoveryProvider, Gateway,
    adapters::load_snapshot_file,
    config::{ConfigOverrides, ConfigValidator, GatewayConfig, load_config},
    gateway::{RELOAD_DEBOUNCE, load_initial_snapshot, spawn_discovery_watch},
    ports::discovery::DiscoveryProvider,
    tracing_setup,
    utils::graceful_shutdown::GracefulShutdown,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(flatten)]
    serve: ServeArgs,
}

#[derive(clap::Args, Debug, Clone, Default)]
struct ServeArgs {
    /// Gateway configuration file (YAML, TOML or JSON)
    #[clap(short, long)]
    config: Option<String>,

    /// Overrides `listen_addr`
    #[clap(long)]
    listen: Option<String>,

    /// Overrides `dispatch.worker_threads`
    #[clap(long)]
    workers: Option<usize>,

    /// Overrides `log.level`
    #[clap(long)]
    log_level: Option<String>,

    /// Overrides `discovery.path`
    #[clap(long)]
    discovery: Option<String>,
}

impl ServeArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            listen_addr: self.listen.clone(),
            worker_threads: self.workers,
            log_level: self.log_level.clone(),
            discovery_path: self.discovery.clone(),
        }
    }
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate the gateway configuration and its discovery file
    Validate(ServeArgs),
    /// Write a starter configuration and discovery file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "gatehouse.yaml")]
        config: String,
        /// Output path for the new discovery file
        #[clap(short, long, default_value = "discovery.yaml")]
        discovery: String,
    },
    /// Start the gateway (default)
    Serve(ServeArgs),
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    match args.command {
        Some(Commands::Validate(serve)) => validate_config_command(&serve),
        Some(Commands::Init { config, discovery }) => init_config_command(&config, &discovery),
        Some(Commands::Serve(serve)) => serve_command(&serve),
        None => serve_command(&args.serve),
    }
}

fn serve_command(args: &ServeArgs) -> Result<()> {
    let config = load_config(args.config.as_deref(), args.overrides())
        .context("Failed to load gateway configuration")?;
    ConfigValidator::validate(&config).map_err(|e| eyre!("{e}"))?;
    tracing_setup::init_tracing(&config.log)?;

    // The async runtime only carries I/O; the pipeline runs on the dispatch
    // workers, which drive their futures through this runtime's handle.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("gatehouse-io")
        .build()
        .context("Failed to build async runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: GatewayConfig) -> Result<()> {
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;
    let discovery_path = config.discovery.path.clone();

    let gateway = Arc::new(Gateway::builder(config).build(tokio::runtime::Handle::current())?);

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    let signal_handler_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_handler_shutdown.run_signal_handler().await {
            tracing::error!("Signal handler error: {:?}", e);
        }
    });

    let watcher = match discovery_path {
        Some(path) => {
            let provider: Arc<dyn DiscoveryProvider> = Arc::new(
                FileDiscoveryProvider::new(&path)
                    .with_context(|| format!("Failed to watch discovery file {path}"))?,
            );
            load_initial_snapshot(&gateway, provider.as_ref()).await?;
            Some(spawn_discovery_watch(
                gateway.clone(),
                provider,
                graceful_shutdown.token(),
                RELOAD_DEBOUNCE,
            ))
        }
        None => {
            tracing::warn!("No discovery file configured; every request will be unroutable");
            None
        }
    };

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    tracing::info!("Gatehouse listening on {}", addr);

    let shutdown_signal = graceful_shutdown.clone();
    axum::serve(
        listener,
        gateway
            .router()
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let reason = shutdown_signal.wait_for_shutdown_signal().await;
        tracing::info!(?reason, "Stopping listener");
    })
    .await
    .context("Server error")?;

    if let Some(watcher) = watcher {
        watcher.abort();
    }

    let drain = graceful_shutdown.drain_timeout();
    let draining = gateway.clone();
    match tokio::time::timeout(
        drain,
        tokio::task::spawn_blocking(move || draining.shutdown()),
    )
    .await
    {
        Ok(Ok(())) => tracing::info!("Dispatch workers drained"),
        Ok(Err(e)) => tracing::error!("Dispatch shutdown task failed: {:?}", e),
        Err(_) => tracing::warn!(?drain, "Dispatch workers did not drain in time"),
    }

    tracing::info!("Graceful shutdown completed");
    Ok(())
}

/// Validate configuration (and the discovery file it names) and exit
fn validate_config_command(args: &ServeArgs) -> Result<()> {
    let origin = args.config.as_deref().unwrap_or("<defaults>");
    println!("Validating configuration: {origin}");

    let config = match load_config(args.config.as_deref(), args.overrides()) {
        Ok(config) => {
            println!("Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("Configuration parsing failed:");
            eprintln!("   {e:?}");
            std::process::exit(1);
        }
    };

    if let Err(e) = ConfigValidator::validate(&config) {
        eprintln!("Configuration validation failed:");
        eprintln!("{e}");
        std::process::exit(1);
    }
    println!("Configuration validation: OK");

    if let Some(path) = &config.discovery.path {
        let snapshot = match load_snapshot_file(Path::new(path)) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                eprintln!("Discovery file {path} could not be read:");
                eprintln!("   {e:?}");
                std::process::exit(1);
            }
        };
        if let Err(e) = ConfigValidator::validate_snapshot(&snapshot) {
            eprintln!("Discovery file {path} is invalid:");
            eprintln!("{e}");
            std::process::exit(1);
        }
        println!(
            "Discovery file: OK ({} rules, {} services)",
            snapshot.rules.len(),
            snapshot.services.len()
        );
    }

    println!();
    println!("Configuration Summary:");
    println!("   Listen Address: {}", config.listen_addr);
    println!("   Workers: {}", config.dispatch.effective_worker_threads());
    println!("   Queue Buffer: {}", config.dispatch.buffer_size);
    println!("   Wait Strategy: {:?}", config.dispatch.wait_strategy);
    println!("   Completion Mode: {:?}", config.completion_mode);
    Ok(())
}

/// Write starter configuration files
fn init_config_command(config_path: &str, discovery_path: &str) -> Result<()> {
    for path in [config_path, discovery_path] {
        if Path::new(path).exists() {
            eprintln!("Error: '{path}' already exists");
            std::process::exit(1);
        }
    }

    let default_config = format!(
        r#"# Gatehouse API gateway configuration
listen_addr: "0.0.0.0:8888"
application_name: "api-gateway"
env: "dev"

dispatch:
  worker_threads: 0        # one per core
  buffer_size: 16384       # power of two
  wait_strategy: blocking  # blocking | busy_spin | yielding | sleeping

http_client:
  connect_timeout_ms: 30000
  request_timeout_ms: 30000

completion_mode: single_async

rate_limit:
  on_store_error: fail_open

auth:
  secret: "change-me"

discovery:
  path: "{discovery_path}"

log:
  level: "info"
  json: true
"#
    );

    let default_discovery = r#"# Routing rules and service instances; reloaded on change
rules:
  - id: "user-rule"
    service_id: "user"
    prefix: "/user"
    paths: ["/user/info"]
    order: 0
    retry_config:
      times: 2
    filter_configs:
      - id: "load_balance_filter"
        config: '{"load_balance": "RoundRobin"}'
      - id: "flow_ctl_filter"
    flow_control_configs:
      - type: "path"
        value: "/user/info"
        algorithm: "fixed_window"
        config: '{"duration": 1, "permits": 100}'

services:
  - definition:
      unique_id: "user:1.0"
      service_id: "user"
      version: "1.0"
    instances:
      - instance_id: "127.0.0.1:8081"
        unique_id: "user:1.0"
        ip: "127.0.0.1"
        port: 8081
"#;

    std::fs::write(config_path, default_config).context("Failed to write config file")?;
    std::fs::write(discovery_path, default_discovery)
        .context("Failed to write discovery file")?;
    println!("Created {config_path} and {discovery_path}");
    println!("   Run 'gatehouse serve --config {config_path}' to start the gateway");
    Ok(())
}
