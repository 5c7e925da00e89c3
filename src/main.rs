// The storage trait exposes the full backend operation set even where the
// current call graph does not reach every operation. Allow dead_code
// crate-wide rather than annotating the seam.
#![allow(dead_code)]

mod config;
mod crawler;
mod http;
mod keygen;
mod ratelimit;
mod ssh;
mod store;
mod tunnel;
mod views;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::crawler::ChatCrawlerDetector;
use crate::ratelimit::RateLimiter;
use crate::store::redis::{create_redis_pool, RedisStore};
use crate::store::Store;
use crate::tunnel::{TunnelRegistry, REAPER_INTERVAL};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "codedrop",
    about = "Share code from your terminal: SSH in, HTTPS out"
)]
struct Cli {
    /// Override the ENV variable (dev or prod).
    #[arg(long)]
    env: Option<String>,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared by the SSH plane, the HTTP plane, and the reaper.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub tunnels: Arc<TunnelRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub crawler: Arc<ChatCrawlerDetector>,
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.env.is_dev() {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: Arc<AppState>) -> Result<()> {
    let app = http::create_router(Arc::clone(&state));

    let listen_addr = SocketAddr::from(([0, 0, 0, 0], state.config.http_port));
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind http listener on {listen_addr}"))?;

    info!(%listen_addr, "http server listening");

    axum::serve(listener, app).await.context("http server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Tunnel reaper
// ---------------------------------------------------------------------------

async fn run_tunnel_reaper(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(REAPER_INTERVAL);
    // The first tick completes immediately; skip it so sweeps start one
    // interval after boot.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let reaped = state.tunnels.clean_up();
        info!(reaped, "cleaned up tunnels");
    }
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
        () = ctrl_c => info!("received SIGINT"),
        () = terminate => info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Arc::new(config::load(cli.env.as_deref())?);

    init_tracing(&config);
    info!(env = %config.env, "starting codedrop");

    // ---- Storage ----
    let pool = create_redis_pool(&config.redis).await?;
    let store: Arc<dyn Store> = Arc::new(RedisStore::new(pool));

    // ---- App state ----
    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        store: Arc::clone(&store),
        tunnels: Arc::new(TunnelRegistry::new()),
        limiter: Arc::new(RateLimiter::new(store)),
        crawler: Arc::new(ChatCrawlerDetector::new()),
    });

    // ---- HTTP plane (background; a failure here is fatal) ----
    tokio::spawn({
        let state = Arc::clone(&state);
        async move {
            if let Err(err) = run_http_server(state).await {
                error!(error = %err, "http server failed");
                std::process::exit(1);
            }
        }
    });

    // ---- Tunnel reaper ----
    tokio::spawn({
        let state = Arc::clone(&state);
        async move { run_tunnel_reaper(state).await }
    });

    // ---- SSH plane (foreground) ----
    tokio::select! {
        result = ssh::start_ssh_server(Arc::clone(&state)) => {
            result.context("ssh server failed")?;
        }
        () = shutdown_signal() => {
            // Release every producer blocked in a live tunnel before exiting.
            state.tunnels.shutdown();
            info!("codedrop shut down cleanly");
        }
    }

    Ok(())
}
