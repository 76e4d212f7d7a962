use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use alloy::primitives::{Address, B256, U256};
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::health::HealthState;
use crate::cache::CacheStore;
use crate::chain::{event_signature, ChainClient, SubscriptionEvent};
use crate::config::{keys, BACKFILL_WINDOW_BLOCKS};
use crate::contracts::IBribeMarket;
use crate::error::{AppError, Result};
use crate::state::PositionTracker;
use crate::types::{condition_key, IndexedMarket};

/// Result of one backfill pass over `from_block..=to_block`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillReport {
    pub from_block: u64,
    pub to_block: u64,
    pub fetched: usize,
    /// Markets written, or positions newly tracked.
    pub applied: usize,
    pub failed: usize,
}

const WATCHED_EVENTS: [B256; 2] = [
    IBribeMarket::MarketCreated::SIGNATURE_HASH,
    IBribeMarket::Deposited::SIGNATURE_HASH,
];

/// Inclusive block range scanned for a chain at `height`.
pub fn backfill_range(height: u64) -> (u64, u64) {
    (height.saturating_sub(BACKFILL_WINDOW_BLOCKS), height)
}

/// Mirrors `MarketCreated` logs into the cache and feeds `Deposited` logs to
/// the position tracker, first from history and then from a live feed.
pub struct EventIndexer {
    chain: Arc<dyn ChainClient>,
    cache: Arc<dyn CacheStore>,
    tracker: Arc<PositionTracker>,
    contract: Address,
    health: Arc<HealthState>,
    /// Highest block whose logs have been applied (0 = none yet).
    last_seen_block: AtomicU64,
}

impl EventIndexer {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        cache: Arc<dyn CacheStore>,
        tracker: Arc<PositionTracker>,
        contract: Address,
        health: Arc<HealthState>,
    ) -> Self {
        Self {
            chain,
            cache,
            tracker,
            contract,
            health,
            last_seen_block: AtomicU64::new(0),
        }
    }

    fn mark_seen(&self, block: u64) {
        self.last_seen_block.fetch_max(block, Ordering::AcqRel);
    }

    /// Index every `MarketCreated` log in the backfill window. Per-log failures
    /// are counted; a failed height or log query is returned as an error.
    pub async fn backfill(&self) -> Result<BackfillReport> {
        let height = self.chain.current_height().await?;
        let (from_block, to_block) = backfill_range(height);
        let logs = self
            .chain
            .get_logs(self.contract, IBribeMarket::MarketCreated::SIGNATURE_HASH, from_block, to_block)
            .await?;

        let mut report = BackfillReport {
            from_block,
            to_block,
            fetched: logs.len(),
            ..Default::default()
        };
        for log in &logs {
            match self.persist(log).await {
                Ok(_) => report.applied += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(tx = ?log.transaction_hash, "Skipping market log during backfill: {e}");
                }
            }
        }

        self.health.set_last_backfill_block(to_block);
        self.mark_seen(to_block);
        info!(
            from = report.from_block,
            to = report.to_block,
            fetched = report.fetched,
            persisted = report.applied,
            failed = report.failed,
            "Market backfill complete"
        );
        Ok(report)
    }

    /// Seed the position tracker from `Deposited` logs in the backfill window.
    pub async fn backfill_positions(&self) -> Result<BackfillReport> {
        let height = self.chain.current_height().await?;
        let (from_block, to_block) = backfill_range(height);
        let logs = self
            .chain
            .get_logs(self.contract, IBribeMarket::Deposited::SIGNATURE_HASH, from_block, to_block)
            .await?;

        let applied = logs.iter().filter(|log| self.tracker.discover(log)).count();
        self.mark_seen(to_block);
        let report = BackfillReport {
            from_block,
            to_block,
            fetched: logs.len(),
            applied,
            failed: 0,
        };
        info!(
            from = report.from_block,
            to = report.to_block,
            deposits = report.fetched,
            new_positions = report.applied,
            tracked = self.tracker.len(),
            "Position backfill complete"
        );
        Ok(report)
    }

    /// Write the market carried by a `MarketCreated` log.
    ///
    /// Repeating the call with the same log leaves the stored record unchanged:
    /// an existing record keeps its `createdAt`. The ordered-index entry is
    /// always re-added so a record written without one is repaired.
    pub async fn persist(&self, log: &Log) -> Result<IndexedMarket> {
        let decoded = IBribeMarket::MarketCreated::decode_log(&log.inner)?;
        let event = decoded.data;

        if event.outcomeSlotCount < U256::from(2) {
            return Err(AppError::Decode(format!(
                "market {} has {} outcome slots",
                event.conditionId, event.outcomeSlotCount
            )));
        }

        let id = condition_key(&event.conditionId);
        let key = format!("{}{id}", keys::MARKET_PREFIX);

        let created_at = match self.cache.get(&key).await? {
            Some(bytes) => match serde_json::from_slice::<IndexedMarket>(&bytes) {
                Ok(existing) => existing.created_at,
                Err(e) => {
                    warn!(market = %id, "Stored market record unreadable, rewriting: {e}");
                    now_ms()
                }
            },
            None => now_ms(),
        };

        let market = IndexedMarket {
            condition_id: event.conditionId,
            oracle: event.oracle,
            question_id: event.questionId,
            outcome_slot_count: u64::try_from(event.outcomeSlotCount).unwrap_or(u64::MAX),
            block_number: log.block_number.unwrap_or(0),
            transaction_hash: log.transaction_hash.unwrap_or(B256::ZERO),
            created_at,
            start_time: event.startTime,
            end_time: event.endTime,
        };

        self.cache.set(&key, &serde_json::to_vec(&market)?).await?;
        self.cache
            .zset_add(keys::MARKETS_BY_CREATED, created_at as f64, &id)
            .await?;

        debug!(market = %id, block = market.block_number, "Market persisted");
        Ok(market)
    }

    /// Re-read both events from the last applied block up to the chain head
    /// and apply them. Fills the window between backfill and subscription,
    /// and whatever a feed reconnect missed. Returns how many logs were read.
    pub async fn catch_up(&self) -> Result<usize> {
        let head = self.chain.current_height().await?;
        let seen = self.last_seen_block.load(Ordering::Acquire);
        let from_block = if seen == 0 { backfill_range(head).0 } else { seen };
        if from_block > head {
            return Ok(0);
        }

        let mut logs = Vec::new();
        for event in WATCHED_EVENTS {
            logs.extend(self.chain.get_logs(self.contract, event, from_block, head).await?);
        }
        logs.sort_by_key(|log| (log.block_number, log.log_index));

        let fetched = logs.len();
        self.handle_batch(logs).await;
        self.mark_seen(head);
        info!(from = from_block, to = head, fetched, "Caught up with chain head");
        Ok(fetched)
    }

    /// Consume the live feed until `cancel` fires or the feed ends.
    pub async fn watch(&self, cancel: CancellationToken) -> Result<()> {
        let mut subscription = self.chain.subscribe(self.contract, &WATCHED_EVENTS).await?;
        // May overlap the live feed; both paths are idempotent.
        if let Err(e) = self.catch_up().await {
            warn!("Catch-up after subscribing failed: {e}");
        }
        self.health.set_subscription_live(true);
        info!(contract = %self.contract, "Live log subscription open");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Live log subscription cancelled");
                    break;
                }
                event = subscription.next_event() => match event {
                    Some(SubscriptionEvent::Logs(logs)) => self.handle_batch(logs).await,
                    Some(SubscriptionEvent::Reconnected) => {
                        info!("Live log feed reconnected, replaying missed blocks");
                        if let Err(e) = self.catch_up().await {
                            warn!("Catch-up after reconnect failed: {e}");
                        }
                    }
                    None => {
                        warn!("Live log subscription ended by producer");
                        break;
                    }
                }
            }
        }

        self.health.set_subscription_live(false);
        subscription.close().await;
        Ok(())
    }

    /// Apply one batch of live or replayed logs. A failing log does not stop
    /// the rest.
    async fn handle_batch(&self, logs: Vec<Log>) {
        let mut processed = 0u64;
        let mut failed = 0u64;

        for log in &logs {
            if let Some(block) = log.block_number {
                self.mark_seen(block);
            }
            match event_signature(log) {
                Some(sig) if sig == IBribeMarket::MarketCreated::SIGNATURE_HASH => {
                    match self.persist(log).await {
                        Ok(market) => {
                            processed += 1;
                            info!(market = %condition_key(&market.condition_id), "New market indexed");
                        }
                        Err(e) => {
                            failed += 1;
                            error!(tx = ?log.transaction_hash, "Failed to index live market log: {e}");
                        }
                    }
                }
                Some(sig) if sig == IBribeMarket::Deposited::SIGNATURE_HASH => {
                    self.tracker.discover(log);
                    processed += 1;
                }
                other => debug!(topic0 = ?other, "Ignoring unexpected log"),
            }
        }

        self.health.record_live_batch(processed, failed);
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
