use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use alloy::primitives::{Address, U256};
use serde::Serialize;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainClient, ReceiptStatus};
use crate::config::HARVEST_INTERVAL_SECS;
use crate::error::{AppError, Result};
use crate::harvest::stats::HarvestStats;
use crate::state::PositionTracker;
use crate::types::{CycleSummary, CycleTrigger, HarvestOutcome, HarvestStatus, Position};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Running,
}

/// Holds the Running state. Dropping it (including on unwind) returns the
/// scheduler to Idle.
pub struct RunningGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Periodically harvests every tracked position, one at a time. At most one
/// cycle or manual harvest runs at any moment.
pub struct HarvestScheduler {
    chain: Arc<dyn ChainClient>,
    tracker: Arc<PositionTracker>,
    contract: Address,
    running: Arc<AtomicBool>,
    period: Duration,
    stats: HarvestStats,
}

impl HarvestScheduler {
    pub fn new(chain: Arc<dyn ChainClient>, tracker: Arc<PositionTracker>, contract: Address) -> Arc<Self> {
        Self::with_period(chain, tracker, contract, Duration::from_secs(HARVEST_INTERVAL_SECS))
    }

    pub fn with_period(
        chain: Arc<dyn ChainClient>,
        tracker: Arc<PositionTracker>,
        contract: Address,
        period: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            chain,
            tracker,
            contract,
            running: Arc::new(AtomicBool::new(false)),
            period,
            stats: HarvestStats::new(),
        })
    }

    pub fn state(&self) -> SchedulerState {
        if self.running.load(Ordering::Acquire) {
            SchedulerState::Running
        } else {
            SchedulerState::Idle
        }
    }

    pub fn stats(&self) -> &HarvestStats {
        &self.stats
    }

    /// Idle → Running, or `None` if something already runs.
    fn try_claim(&self) -> Option<RunningGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunningGuard {
                flag: self.running.clone(),
            })
    }

    /// Timer loop. Each cycle completes before the next tick is awaited; a
    /// tick that finds a manual cycle in flight is skipped.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // skip immediate first tick

        info!(period_secs = self.period.as_secs(), "Harvest scheduler started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Harvest scheduler stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.try_claim() {
                Some(_guard) => {
                    self.run_cycle(CycleTrigger::Timer).await;
                }
                None => {
                    self.stats.record_skipped_tick();
                    info!("Harvest tick skipped: a cycle is already running");
                }
            }
        }
    }

    /// Run a cycle now if the scheduler is Idle.
    pub async fn trigger_now(&self) -> Result<CycleSummary> {
        let _guard = self.try_claim().ok_or(AppError::Busy)?;
        Ok(self.run_cycle(CycleTrigger::Manual).await)
    }

    /// Claim the scheduler and run a cycle in the background. Returns false,
    /// without starting anything, if a cycle is already running.
    pub fn spawn_trigger_now(self: &Arc<Self>) -> bool {
        let Some(guard) = self.try_claim() else {
            return false;
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            this.run_cycle(CycleTrigger::Manual).await;
        });
        true
    }

    /// Harvest a single position, outside any cycle.
    pub async fn harvest_one(&self, position: Position) -> Result<HarvestOutcome> {
        let _guard = self.try_claim().ok_or(AppError::Busy)?;
        let outcome = self.attempt(position).await;
        self.stats.record_outcome(&outcome);
        Ok(outcome)
    }

    /// One pass over the tracker snapshot. Caller holds the guard.
    async fn run_cycle(&self, trigger: CycleTrigger) -> CycleSummary {
        let started_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let started = Instant::now();
        let positions = self.tracker.snapshot();
        info!(trigger = %trigger, positions = positions.len(), "Harvest cycle started");

        let mut outcomes = Vec::with_capacity(positions.len());
        for position in positions {
            outcomes.push(self.attempt(position).await);
        }

        let summary = CycleSummary {
            trigger,
            started_at_ms,
            duration: started.elapsed(),
            outcomes,
        };
        self.stats.record_cycle(&summary);
        log_summary(&summary);
        summary
    }

    /// Every failure is contained here and reported as `Failed`.
    async fn attempt(&self, position: Position) -> HarvestOutcome {
        let status = match self.harvest_position(position).await {
            Ok(status) => status,
            Err(e) => {
                error!(position = %position, "Harvest failed: {e}");
                HarvestStatus::Failed { error: e.to_string() }
            }
        };
        HarvestOutcome { position, status }
    }

    async fn harvest_position(&self, position: Position) -> Result<HarvestStatus> {
        let pending = self.chain.pending_rewards(self.contract, position).await?;
        if pending == U256::ZERO {
            debug!(position = %position, "Nothing pending");
            return Ok(HarvestStatus::NothingPending);
        }

        let tx_hash = self.chain.submit_harvest(self.contract, position).await?;
        match self.chain.await_confirmation(tx_hash).await? {
            ReceiptStatus::Success => {
                info!(position = %position, tx = %tx_hash, amount = %pending, "Harvested");
                Ok(HarvestStatus::Harvested { amount: pending })
            }
            ReceiptStatus::Failed => {
                warn!(position = %position, tx = %tx_hash, "Harvest transaction reverted");
                Ok(HarvestStatus::Failed {
                    error: format!("transaction {tx_hash} reverted"),
                })
            }
        }
    }
}

fn log_summary(summary: &CycleSummary) {
    if summary.harvested() == 0 {
        info!(
            trigger = %summary.trigger,
            attempted = summary.attempted(),
            nothing_pending = summary.nothing_pending(),
            failed = summary.failed(),
            duration_ms = summary.duration.as_millis() as u64,
            "Harvest cycle complete: nothing harvested this cycle"
        );
    } else {
        info!(
            trigger = %summary.trigger,
            attempted = summary.attempted(),
            harvested = summary.harvested(),
            nothing_pending = summary.nothing_pending(),
            failed = summary.failed(),
            total = %summary.total_harvested(),
            duration_ms = summary.duration.as_millis() as u64,
            "Harvest cycle complete"
        );
    }
}
