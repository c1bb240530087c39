//! EcoTask coordinator: entry point.
//!
//! Hosts a single [`ecotask_protocol::EcoTaskProtocol`] instance behind an
//! Axum REST API, journals every emitted event to SQLite together with a
//! snapshot of the protocol store, and runs a background keeper that
//! drives deadline-based transitions.

mod api;
mod config;
mod db;
mod errors;
mod events;
mod keeper;
mod state;

use std::sync::Arc;
use std::time::Duration;

use ecotask_protocol::SystemClock;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    let state = Arc::new(AppState::restore(pool, &config, Arc::new(SystemClock)).await?);
    state.ensure_super_admin(config.super_admin.as_deref()).await?;

    let shutdown = CancellationToken::new();

    // ─── Background keeper ────────────────────────────────
    let keeper = if config.keeper_interval_secs > 0 {
        Some(tokio::spawn(keeper::run(
            state.clone(),
            Duration::from_secs(config.keeper_interval_secs),
            shutdown.clone(),
        )))
    } else {
        info!("Keeper disabled");
        None
    };

    // ─── REST API ─────────────────────────────────────────
    let app = api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Some(keeper) = keeper {
        keeper.await?;
    }
    info!("Coordinator stopped");
    Ok(())
}

/// Resolve on Ctrl-C, cancelling `shutdown` so the keeper stops too.
async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for Ctrl-C: {e}");
            }
        }
        _ = shutdown.cancelled() => {}
    }
    info!("Shutdown requested");
    shutdown.cancel();
}
