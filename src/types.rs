use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

/// Highest outcome index a position may carry (binary markets).
pub const MAX_OUTCOME: u8 = 1;

/// `(conditionId, outcome)` key for one harvestable reward accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub condition_id: B256,
    pub outcome: u8,
}

impl Position {
    pub fn new(condition_id: B256, outcome: u8) -> Self {
        Self { condition_id, outcome }
    }

    /// A position is usable only with a non-zero condition id and a binary outcome.
    pub fn is_well_formed(&self) -> bool {
        !self.condition_id.is_zero() && self.outcome <= MAX_OUTCOME
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", condition_key(&self.condition_id), self.outcome)
    }
}

/// Lowercase 0x-prefixed hex used for cache keys and index members.
pub fn condition_key(condition_id: &B256) -> String {
    alloy::hex::encode_prefixed(condition_id)
}

// ---------------------------------------------------------------------------
// Indexed markets
// ---------------------------------------------------------------------------

/// Cached projection of a `MarketCreated` log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedMarket {
    pub condition_id: B256,
    pub oracle: Address,
    pub question_id: B256,
    pub outcome_slot_count: u64,
    pub block_number: u64,
    pub transaction_hash: B256,
    /// Indexer wall clock when first observed, unix milliseconds.
    pub created_at: u64,
    /// Chain-reported unix seconds.
    pub start_time: u64,
    pub end_time: u64,
}

// ---------------------------------------------------------------------------
// Bribe pools
// ---------------------------------------------------------------------------

/// Live view of one sponsor bribe pool. Never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BribePoolView {
    pub id: U256,
    pub sponsor: Address,
    pub token: Address,
    pub total_amount: U256,
    pub start_time: u64,
    pub end_time: u64,
    pub condition_id: B256,
    pub outcome: u8,
}

/// Result of a bribe lookup. `available == false` means the chain read failed
/// and `pools` is empty because the answer is unknown, not because none exist.
#[derive(Debug, Clone, Default)]
pub struct BribePools {
    pub pools: Vec<BribePoolView>,
    pub available: bool,
}

// ---------------------------------------------------------------------------
// Harvest results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HarvestStatus {
    /// Transaction confirmed; carries the pending amount observed before sending.
    Harvested { amount: U256 },
    /// Pending rewards were zero, no transaction was sent.
    NothingPending,
    Failed { error: String },
}

impl std::fmt::Display for HarvestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HarvestStatus::Harvested { .. } => "harvested",
            HarvestStatus::NothingPending => "nothing_pending",
            HarvestStatus::Failed { .. } => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestOutcome {
    pub position: Position,
    pub status: HarvestStatus,
}

impl HarvestOutcome {
    pub fn success(&self) -> bool {
        matches!(self.status, HarvestStatus::Harvested { .. })
    }

    pub fn amount_harvested(&self) -> U256 {
        match &self.status {
            HarvestStatus::Harvested { amount } => *amount,
            _ => U256::ZERO,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.status {
            HarvestStatus::Failed { error } => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleTrigger {
    Timer,
    Manual,
}

impl std::fmt::Display for CycleTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleTrigger::Timer => write!(f, "timer"),
            CycleTrigger::Manual => write!(f, "manual"),
        }
    }
}

/// Aggregate of one harvest cycle.
#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub trigger: CycleTrigger,
    pub started_at_ms: u64,
    pub duration: Duration,
    pub outcomes: Vec<HarvestOutcome>,
}

impl CycleSummary {
    pub fn attempted(&self) -> usize {
        self.outcomes.len()
    }

    pub fn harvested(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success()).count()
    }

    pub fn nothing_pending(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == HarvestStatus::NothingPending)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error().is_some()).count()
    }

    /// Sum of `amount_harvested` over successful outcomes.
    pub fn total_harvested(&self) -> U256 {
        self.outcomes
            .iter()
            .fold(U256::ZERO, |acc, o| acc.saturating_add(o.amount_harvested()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(byte: u8, status: HarvestStatus) -> HarvestOutcome {
        HarvestOutcome {
            position: Position::new(B256::repeat_byte(byte), 0),
            status,
        }
    }

    #[test]
    fn position_well_formedness() {
        assert!(Position::new(B256::repeat_byte(0xaa), 0).is_well_formed());
        assert!(Position::new(B256::repeat_byte(0xaa), 1).is_well_formed());
        assert!(!Position::new(B256::repeat_byte(0xaa), 2).is_well_formed());
        assert!(!Position::new(B256::ZERO, 1).is_well_formed());
    }

    #[test]
    fn condition_key_is_lowercase_prefixed_hex() {
        let key = condition_key(&B256::repeat_byte(0xAB));
        assert_eq!(key.len(), 66);
        assert!(key.starts_with("0xabab"));
    }

    #[test]
    fn summary_counts_each_status_once() {
        let summary = CycleSummary {
            trigger: CycleTrigger::Manual,
            started_at_ms: 0,
            duration: Duration::from_millis(5),
            outcomes: vec![
                outcome(1, HarvestStatus::Harvested { amount: U256::from(50) }),
                outcome(2, HarvestStatus::NothingPending),
                outcome(3, HarvestStatus::Failed { error: "reverted".to_string() }),
                outcome(4, HarvestStatus::Harvested { amount: U256::from(7) }),
            ],
        };
        assert_eq!(summary.attempted(), 4);
        assert_eq!(summary.harvested(), 2);
        assert_eq!(summary.nothing_pending(), 1);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.total_harvested(), U256::from(57));
    }

    #[test]
    fn failed_outcome_exposes_error_and_zero_amount() {
        let o = outcome(9, HarvestStatus::Failed { error: "boom".to_string() });
        assert!(!o.success());
        assert_eq!(o.error(), Some("boom"));
        assert_eq!(o.amount_harvested(), U256::ZERO);
    }
}
