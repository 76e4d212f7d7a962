//! Shared health state for the /health endpoint.
//! Updated by the indexer, read by the API.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Default)]
pub struct HealthState {
    /// True while the live log subscription is being consumed.
    subscription_live: AtomicBool,
    /// Head block of the last completed market backfill (0 = none).
    last_backfill_block: AtomicU64,
    live_logs_processed: AtomicU64,
    live_log_failures: AtomicU64,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_subscription_live(&self, v: bool) {
        self.subscription_live.store(v, Ordering::Relaxed);
    }

    pub fn set_last_backfill_block(&self, block: u64) {
        self.last_backfill_block.store(block, Ordering::Relaxed);
    }

    pub fn record_live_batch(&self, processed: u64, failed: u64) {
        self.live_logs_processed.fetch_add(processed, Ordering::Relaxed);
        self.live_log_failures.fetch_add(failed, Ordering::Relaxed);
    }

    pub fn subscription_live(&self) -> bool {
        self.subscription_live.load(Ordering::Relaxed)
    }

    pub fn last_backfill_block(&self) -> u64 {
        self.last_backfill_block.load(Ordering::Relaxed)
    }

    pub fn live_logs_processed(&self) -> u64 {
        self.live_logs_processed.load(Ordering::Relaxed)
    }

    pub fn live_log_failures(&self) -> u64 {
        self.live_log_failures.load(Ordering::Relaxed)
    }
}
