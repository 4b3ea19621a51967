// ============================
// crates/backend-bin/src/main.rs
// ============================
//! Tokio / Axum entry‑point for the chapter lock server.

use anyhow::Context;
use backend_lib::{config::Settings, ws_router, AppState};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "chapterlock-server", about = "Chapter edit-lock coordinator")]
struct Cli {
    /// Path to TOML config file
    #[arg(long, short, default_value = backend_lib::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Address to listen on
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Merge: CLI args > env > config file > defaults
    let mut settings = Settings::load_from(&cli.config)?;
    if let Some(bind) = cli.bind {
        settings.bind_addr = bind;
    }
    if let Some(level) = cli.log_level {
        settings.log_level = level;
    }
    settings.validate()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| settings.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(config = %cli.config.display(), "settings loaded");
    tracing::info!(
        ttl_ms = settings.lock.ttl_ms,
        heartbeat_interval_ms = settings.lock.heartbeat_interval_ms(),
        sweep_interval_ms = settings.lock.sweep_interval_ms(),
        "lease timing"
    );
    if settings.uses_dev_secret() {
        tracing::warn!("using the development JWT secret; set CHAPTERLOCK_AUTH__JWT_SECRET in production");
    }

    let addr = settings.bind_addr;
    let state = Arc::new(AppState::new(settings));
    let sweeper = state.spawn_sweeper();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = ws_router::create_router(state).layer(cors);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
