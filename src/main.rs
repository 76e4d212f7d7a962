mod api;
mod cache;
mod chain;
mod config;
mod contracts;
mod error;
mod harvest;
mod indexer;
mod query;
mod state;
mod types;


use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::health::HealthState;
use crate::api::routes::{router, ApiState};
use crate::config::Config;
use crate::error::Result;
use crate::harvest::HarvestScheduler;
use crate::indexer::{EventIndexer, MigrationGuard, MigrationOutcome};
use crate::query::QueryFacade;
use crate::state::PositionTracker;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Capabilities: the only failures that stop the process ---
    let chain = chain::connect(&cfg).await?;
    let cache = cache::connect(&cfg).await?;
    let contract = cfg.contract_address;

    // --- Contract identity check, before anything is indexed ---
    match MigrationGuard::new(cache.clone()).ensure_consistency(contract).await {
        MigrationOutcome::Migrated { previous, removed } => {
            info!(previous = %previous, removed, "Started on a new contract deployment");
        }
        MigrationOutcome::Skipped => warn!("Contract identity check skipped; cache may hold stale markets"),
        MigrationOutcome::FirstRun | MigrationOutcome::Unchanged => {}
    }

    // --- Components, built once and shared ---
    let health = Arc::new(HealthState::new());
    let tracker = PositionTracker::new();
    let indexer = Arc::new(EventIndexer::new(
        chain.clone(),
        cache.clone(),
        tracker.clone(),
        contract,
        health.clone(),
    ));
    let scheduler = HarvestScheduler::new(chain.clone(), tracker.clone(), contract);
    let query = Arc::new(QueryFacade::new(chain.clone(), cache.clone(), contract));

    // --- Backfill: failures leave a partial cache, never stop startup ---
    if let Err(e) = indexer.backfill().await {
        error!("Market backfill failed, continuing with a partial cache: {e}");
    }
    if let Err(e) = indexer.backfill_positions().await {
        error!("Position backfill failed, continuing with live deposits only: {e}");
    }

    // --- Background tasks ---
    let cancel = CancellationToken::new();

    let watcher = {
        let indexer = indexer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = indexer.watch(cancel).await {
                error!("Live log subscription failed: {e}");
            }
        })
    };

    let harvester = tokio::spawn(scheduler.clone().run(cancel.clone()));

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {e}");
                return;
            }
            info!("Shutdown requested");
            cancel.cancel();
        });
    }

    // --- HTTP API server ---
    let app = router(ApiState {
        query,
        scheduler,
        tracker,
        health,
    });
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await?;

    cancel.cancel();
    let _ = watcher.await;
    let _ = harvester.await;
    info!("Shutdown complete");
    Ok(())
}
