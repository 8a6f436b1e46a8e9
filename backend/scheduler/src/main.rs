//! Airdrop claim scheduler — entry point.
//!
//! Runs two background tasks against the shared `users` table: the
//! dispatcher, which sends claim invitations while supply lasts, and the
//! sweeper, which expires unused claims and promotes the waiting line.
//! A small read-only Axum API reports progress to operators.

mod api;
mod config;
mod db;
mod dispatcher;
mod errors;
mod mailer;
mod scheduler;
mod sweeper;
mod token;
mod users;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use axum::{routing::get, Router};
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::Config;
use scheduler::SchedulerState;
use token::HmacTokenMinter;

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

    let notifier = mailer::from_config(&config)?;
    let minter = HmacTokenMinter::new(&config.claim_token_secret, config.claim_window_secs());

    let shutdown = CancellationToken::new();

    let state = Arc::new(SchedulerState {
        pool: pool.clone(),
        config: config.clone(),
        notifier: Arc::from(notifier),
        minter: Arc::new(minter),
        shutdown: shutdown.clone(),
    });

    let addr = format!("0.0.0.0:{}", config.api_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    // ─── Background tasks ─────────────────────────────────
    let mut tasks = vec![tokio::spawn(dispatcher::run(state.clone()))];
    // Without a cap nobody is waitlisted, so there is nothing to recycle.
    if config.max_supply.is_some() {
        tasks.push(tokio::spawn(sweeper::run(state.clone())));
    } else {
        info!("MAX_SUPPLY not set — sweeper disabled");
    }

    // ─── Status API ───────────────────────────────────────
    let api_state = Arc::new(api::ApiState {
        pool: pool.clone(),
        max_supply: config.max_supply,
    });

    let app = Router::new()
        .route("/health", get(api::health))
        .route("/stats", get(api::get_stats))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(api_state);

    info!("API listening on http://{addr}");

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {e}");
            return;
        }
        info!("Shutdown requested — finishing in-flight runs");
        signal.cancel();
    });

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await;
    if let Err(e) = &served {
        error!("API server failed: {e}");
    }

    drain(&shutdown, tasks, &pool).await;
    info!("Shutdown complete");

    served?;
    Ok(())
}

/// Stop the background loops and wait for them before closing the pool, so
/// in-flight runs commit or roll back and release their connections first.
async fn drain(shutdown: &CancellationToken, tasks: Vec<JoinHandle<()>>, pool: &SqlitePool) {
    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            error!("Scheduler task panicked: {e}");
        }
    }
    pool.close().await;
}
