// Several port surfaces (e.g. storage size aggregation, ledger accessors)
// are exposed for operational tooling ahead of an HTTP surface for them.
// Allow dead_code crate-wide until that surface lands.
#![allow(dead_code)]

mod cache;
mod config;
mod error;
mod health;
mod http;
mod index;
mod ledger;
mod metrics;
mod partition;
mod policy;
mod refraction;
mod request;
mod resolver;
mod storage;
mod upstream;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::index::{MemoryIndex, PackageIndex};
use crate::ledger::{ArtifactLedger, MemoryLedger};
use crate::metrics::MetricsRegistry;
use crate::resolver::Resolver;
use crate::storage::Storage;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "pkgcache", about = "Package Registry Caching Proxy")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/pkgcache/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub storage: Arc<dyn Storage>,
    pub resolver: Arc<Resolver>,
    pub metrics: MetricsRegistry,
    pub http_client: reqwest::Client,
}

impl AppState {
    /// Wire up storage, the partitioner, the package index, and the full
    /// remote/refraction graph from a validated configuration.
    pub async fn from_config(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let metrics = MetricsRegistry::new();

        let http_client = reqwest::Client::builder()
            .user_agent("pkgcache/0.1")
            .build()
            .context("failed to build reqwest client")?;

        let storage = storage::build_storage(&config.storage).await?;

        let index = MemoryIndex::new();
        if let Some(path) = &config.index.preload {
            let count = index
                .preload_file(path)
                .await
                .context("failed to preload package index")?;
            tracing::info!(path = %path, entries = count, "package index preloaded");
        }
        let index: Arc<dyn PackageIndex> = Arc::new(index);

        let partitioner = partition::build_partitioner(
            &config.partition,
            http_client.clone(),
            Arc::clone(&metrics.metrics),
        );

        let ledger: Arc<dyn ArtifactLedger> = Arc::new(MemoryLedger::new());

        let resolver = Resolver::from_config(
            &config,
            Arc::clone(&storage),
            partitioner,
            ledger,
            index,
            Arc::clone(&metrics.metrics),
        )?;

        Ok(Self {
            config,
            storage,
            resolver: Arc::new(resolver),
            metrics,
            http_client,
        })
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let app = http::handler::create_router(Arc::new(state.clone()));

    let listen_addr: std::net::SocketAddr = state
        .config
        .server
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(
        config_path = %cli.config,
        remotes = config.remotes.len(),
        refractions = config.refractions.len(),
        "starting pkgcache"
    );

    // ---- App state ----
    let state = AppState::from_config(config).await?;

    // ---- Serve ----
    run_http_server(state).await?;

    tracing::info!("pkgcache shut down cleanly");
    Ok(())
}
