//! Replexon -- backup history ingestion and metrics for Plex backup jobs.
//!
//! This crate tails the backup log and tracking feed, reconciles both into
//! canonical run records in SQLite, and serves history, metrics and manual
//! triggering over a JSON API.

pub mod analysis;
pub mod api;
pub mod config;
pub mod ingest;
pub mod runs;
pub mod scheduler;
pub mod storage;
pub mod trigger;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::analysis::MetricsService;
use crate::api::state::AppState;
use crate::config::AppConfig;
use crate::scheduler::{Ingestor, PollState, ScheduleBook};
use crate::storage::{CursorStore, DiagnosticLog, Pool, RunStore, TriggerLedger};
use crate::trigger::TriggerService;

/// Ingestion pipeline wired to the given pool.
pub fn ingestor(config: &AppConfig, pool: Pool) -> Ingestor {
    Ingestor::new(
        RunStore::new(pool.clone()),
        CursorStore::new(pool.clone()),
        DiagnosticLog::new(pool),
        config.poller.placeholder_timeout(),
    )
}

/// Handles shared by the API handlers.
pub fn app_state(config: &AppConfig, store: RunStore, pool: Pool) -> Result<AppState> {
    let schedules = ScheduleBook::new(&config.schedules).context("invalid schedules")?;
    Ok(AppState {
        metrics: MetricsService::new(store.clone(), config.metrics.cache_ttl()),
        trigger: TriggerService::from_config(&config.trigger, store.clone(), TriggerLedger::new(pool.clone())),
        diagnostics: DiagnosticLog::new(pool),
        schedules: Arc::new(schedules),
        store,
    })
}

/// Start the Replexon daemon: poller and API server.
pub async fn serve(config: AppConfig) -> Result<()> {
    // 1. Initialize Storage
    tracing::info!(db_path = %config.storage.db_path.display(), "Initializing database");
    let pool = storage::open_pool(&config.storage.db_path)?;

    // 2. Restore ingestion state
    let ingestor = ingestor(&config, pool.clone());
    let state = PollState::restore(&config.sources, ingestor.cursors())?;
    let app_state = app_state(&config, RunStore::new(pool.clone()), pool)?;

    // 3. Start Poller (background task)
    let cancel = CancellationToken::new();
    let poller = tokio::spawn(scheduler::run_poller_loop(
        ingestor,
        config.sources.clone(),
        state,
        config.poller.interval(),
        app_state.metrics.clone(),
        cancel.clone(),
    ));

    // 4. Start API Server
    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.server.bind))?;
    let app = api::router(app_state);

    tracing::info!(%addr, "Replexon listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown requested"),
                _ = shutdown.cancelled() => {}
            }
        })
        .await?;

    // 5. Stop the poller after the listener is closed
    cancel.cancel();
    if let Err(e) = poller.await {
        tracing::error!(error = %e, "poller task ended abnormally");
    }
    Ok(())
}
