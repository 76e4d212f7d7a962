use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use tracing::{error, info, warn};

use crate::cache::CacheStore;
use crate::config::{keys, MIGRATION_ATTEMPTS};
use crate::error::Result;

const RETRY_BACKOFF_MS: u64 = 250;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// No identity was stored; the current address was recorded.
    FirstRun,
    Unchanged,
    /// The contract moved. Every indexed market was removed.
    Migrated { previous: String, removed: usize },
    /// The cache could not be inspected or wiped. Indexing proceeds anyway.
    Skipped,
}

/// Detects a redeployed contract at startup and clears data indexed from the
/// old address before anything new is written.
pub struct MigrationGuard {
    cache: Arc<dyn CacheStore>,
}

impl MigrationGuard {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }

    /// Never fails: cache errors are logged and reported as `Skipped`.
    pub async fn ensure_consistency(&self, current: Address) -> MigrationOutcome {
        let current_hex = alloy::hex::encode_prefixed(current);

        let stored = match self.cache.get(keys::CONTRACT_ADDRESS).await {
            Ok(v) => v.map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string()),
            Err(e) => {
                error!("Migration check skipped, contract identity unreadable: {e}");
                return MigrationOutcome::Skipped;
            }
        };

        let previous = match stored {
            None => {
                if let Err(e) = self.write_identity(&current_hex).await {
                    error!("Failed to record contract identity: {e}");
                    return MigrationOutcome::Skipped;
                }
                info!(contract = %current_hex, "Contract identity recorded (first run)");
                return MigrationOutcome::FirstRun;
            }
            Some(prev) if prev.eq_ignore_ascii_case(&current_hex) => {
                return MigrationOutcome::Unchanged;
            }
            Some(prev) => prev,
        };

        info!(
            previous = %previous,
            current = %current_hex,
            "Contract migration detected, clearing indexed markets"
        );

        for attempt in 1..=MIGRATION_ATTEMPTS {
            match self.wipe(&current_hex).await {
                Ok(removed) => {
                    info!(removed, "Migration wipe complete");
                    return MigrationOutcome::Migrated { previous, removed };
                }
                Err(e) if attempt < MIGRATION_ATTEMPTS => {
                    warn!(attempt, "Migration wipe failed, retrying: {e}");
                    tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS * attempt as u64)).await;
                }
                Err(e) => {
                    error!(attempts = MIGRATION_ATTEMPTS, "Migration wipe gave up: {e}");
                }
            }
        }
        MigrationOutcome::Skipped
    }

    /// Delete every market record and the ordered index, then store the new
    /// identity. The identity goes last so an interrupted wipe repeats.
    async fn wipe(&self, current_hex: &str) -> Result<usize> {
        let mut doomed = self.cache.scan_keys(keys::MARKET_PREFIX).await?;
        let records = doomed.len();
        doomed.push(keys::MARKETS_BY_CREATED.to_string());
        self.cache.delete(&doomed).await?;
        self.write_identity(current_hex).await?;
        Ok(records)
    }

    async fn write_identity(&self, current_hex: &str) -> Result<()> {
        self.cache.set(keys::CONTRACT_ADDRESS, current_hex.as_bytes()).await
    }
}
