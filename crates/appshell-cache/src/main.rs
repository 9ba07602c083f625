//! App Shell Cache - offline-first caching proxy for web applications

use anyhow::{Context, Result, bail};
use appshell_api::{AppState, create_router};
use appshell_core::{CacheConfig, CacheManager, ServiceWorker, WorkerHost};
use appshell_proxy::{OriginClient, OriginClientConfig};
use appshell_storage::{LocalStorage, MemoryStorage, StorageBackend};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;

use config::{Config, LoggingConfig, StorageConfig};

/// App Shell Cache - offline-first caching proxy for web applications
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    /// Bind address
    #[arg(long, env = "APPSHELL_CACHE_BIND")]
    bind: Option<String>,

    /// Port
    #[arg(short, long, env = "APPSHELL_CACHE_PORT")]
    port: Option<u16>,

    /// Origin URL
    #[arg(long, env = "APPSHELL_CACHE_ORIGIN")]
    origin: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    if let Some(origin) = args.origin {
        config.origin.url = origin;
    }

    init_logging(&config.logging);

    info!("Starting App Shell Cache v{}", env!("CARGO_PKG_VERSION"));

    let metrics_handle = if config.metrics.enabled {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("Failed to install Prometheus recorder")?;
        Some(Arc::new(handle))
    } else {
        None
    };

    let storage = init_storage(&config.storage).await?;

    let origin = Arc::new(OriginClient::new(OriginClientConfig {
        url: config.origin.url.clone(),
        timeout: config.origin.timeout_secs.map(Duration::from_secs),
        skip_tls_verify: config.origin.skip_tls_verify,
    })?);

    match origin.ping().await {
        Ok(true) => info!("Origin {} is reachable", config.origin.url),
        Ok(false) => warn!("Origin {} reports server errors", config.origin.url),
        Err(e) => warn!("Origin {} is unreachable: {}", config.origin.url, e),
    }

    let cache = Arc::new(CacheManager::new(
        storage,
        CacheConfig {
            max_size: config.cache.max_size,
        },
    ));

    let host = Arc::new(WorkerHost::new(cache.clone(), origin.clone()));

    // Without a reachable origin the install fails; requests still pass
    // through until a later update installs successfully
    let worker = ServiceWorker::new(config.worker.clone(), cache, origin)?;
    if let Err(e) = host.register(Arc::new(worker)).await {
        warn!("Initial worker install failed: {}", e);
    }

    let state = AppState::new(host.clone(), config.worker.clone())
        .with_body_limit(config.server.body_limit);

    let app = create_router(state, metrics_handle).layer(TraceLayer::new_for_http());

    let bind_addr = args.bind.unwrap_or(config.server.bind_address);
    let port = args.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", bind_addr, port).parse()?;

    info!("Listening on {}", addr);
    info!("Origin: {}", config.origin.url);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    host.shutdown().await;
    info!("Server stopped");
    Ok(())
}

async fn init_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    let storage: Arc<dyn StorageBackend> = match config.backend.as_str() {
        "local" => Arc::new(
            LocalStorage::new(&config.local.path)
                .await
                .with_context(|| format!("Failed to open storage at {}", config.local.path))?,
        ),
        "memory" => Arc::new(MemoryStorage::new()),
        other => bail!("Unknown storage backend: {}", other),
    };

    info!("Using {} storage backend", storage.name());
    Ok(storage)
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
