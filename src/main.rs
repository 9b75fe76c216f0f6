mod admin;
mod cache;
mod config;
mod credentials;
mod db;
mod events;
mod fingerprint;
mod health;
mod janitor;
mod keys;
mod metrics;
mod proxy;
mod ratelimit;
mod upstream;

use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cache::ResponseCache;
use crate::config::Config;
use crate::credentials::CredentialPool;
use crate::events::EventHub;
use crate::metrics::MetricsRegistry;
use crate::ratelimit::RateLimiter;
use crate::upstream::UpstreamClient;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "gh-proxy", about = "Shared caching proxy for the GitHub API")]
struct Cli {
    /// Socket address for the HTTP listener.
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: db::DbPool,
    pub http: reqwest::Client,
    pub cache: ResponseCache,
    pub credentials: CredentialPool,
    pub upstream: UpstreamClient,
    pub ratelimit: Arc<RateLimiter>,
    pub hub: EventHub,
    pub metrics: MetricsRegistry,
    /// Requests served since process start.
    pub total_requests: Arc<AtomicI64>,
    /// Cache hits since process start.
    pub cache_hits: Arc<AtomicI64>,
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState, listen: &str) -> Result<()> {
    let app = proxy::create_router(Arc::new(state));

    let listen_addr: std::net::SocketAddr =
        listen.parse().context("invalid listen address")?;

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

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // ---- Config ----
    let config = Arc::new(config::load_config()?);
    tracing::info!("starting gh-proxy");

    // ---- Durable store ----
    let pool = db::connect(&config.database_url, config.db_max_conns).await?;
    db::migrate(&pool).await?;

    // ---- Infrastructure ----
    let http = upstream::build_http_client()?;
    let metrics = MetricsRegistry::new();
    let hub = EventHub::spawn();

    let credentials = CredentialPool::new(pool.clone());
    let cache = ResponseCache::new(
        pool.clone(),
        config.max_cache_time,
        config.max_cache_size_mb,
    );
    let upstream_client = UpstreamClient::new(http.clone(), credentials.clone());

    // ---- App state ----
    let state = AppState {
        config: Arc::clone(&config),
        db: pool,
        http,
        cache,
        credentials,
        upstream: upstream_client,
        ratelimit: Arc::new(RateLimiter::new()),
        hub,
        metrics,
        total_requests: Arc::new(AtomicI64::new(0)),
        cache_hits: Arc::new(AtomicI64::new(0)),
    };

    // ---- Background janitors ----
    tokio::spawn({
        let cache = state.cache.clone();
        let metrics = state.metrics.clone();
        async move { janitor::run_cache_janitor(cache, metrics).await }
    });
    tokio::spawn({
        let pool = state.db.clone();
        async move { janitor::run_log_janitor(pool).await }
    });

    // ---- Serve until shutdown ----
    run_http_server(state, &cli.listen).await?;

    tracing::info!("gh-proxy shut down cleanly");
    Ok(())
}
