use std::sync::{Arc, Mutex};

use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use dashmap::DashSet;
use tracing::{debug, warn};

use crate::contracts::IBribeMarket;
use crate::types::Position;

// ---------------------------------------------------------------------------
// PositionTracker
// ---------------------------------------------------------------------------

/// Set of harvestable positions discovered from `Deposited` logs.
///
/// Grows for the lifetime of the process and never removes entries. Snapshots
/// come back in first-discovery order.
pub struct PositionTracker {
    /// Membership, checked on every discovered log.
    members: DashSet<Position>,
    /// Insertion order for snapshots.
    order: Mutex<Vec<Position>>,
}

impl PositionTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            members: DashSet::new(),
            order: Mutex::new(Vec::new()),
        })
    }

    /// Decode a `Deposited` log and track its position. Returns true if the
    /// position was new. Malformed logs are logged and ignored.
    pub fn discover(&self, log: &Log) -> bool {
        let decoded = match IBribeMarket::Deposited::decode_log(&log.inner) {
            Ok(d) => d,
            Err(e) => {
                warn!(tx = ?log.transaction_hash, "Undecodable Deposited log: {e}");
                return false;
            }
        };

        let position = Position::new(decoded.data.conditionId, decoded.data.outcome);
        if !position.is_well_formed() {
            warn!(position = %position, "Deposit names an invalid position; ignored");
            return false;
        }
        self.insert(position)
    }

    /// Track `position` directly. Returns true if it was not tracked yet.
    pub fn insert(&self, position: Position) -> bool {
        if !self.members.insert(position) {
            return false;
        }
        self.order
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(position);
        debug!(position = %position, "New position tracked");
        true
    }

    pub fn snapshot(&self) -> Vec<Position> {
        self.order
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::{deposited_log, market_created_log};
    use alloy::primitives::{Address, B256, U256};

    fn contract() -> Address {
        Address::repeat_byte(0x42)
    }

    fn deposit(condition: u8, outcome: u8, block: u64) -> Log {
        deposited_log(
            contract(),
            Position::new(B256::repeat_byte(condition), outcome),
            Address::repeat_byte(0x99),
            U256::from(100),
            block,
        )
    }

    #[test]
    fn duplicate_deposits_track_one_position() {
        let tracker = PositionTracker::new();
        assert!(tracker.discover(&deposit(0xbb, 1, 10)));
        assert!(!tracker.discover(&deposit(0xbb, 1, 11)));
        assert_eq!(tracker.snapshot(), vec![Position::new(B256::repeat_byte(0xbb), 1)]);
    }

    #[test]
    fn same_condition_different_outcomes_are_distinct() {
        let tracker = PositionTracker::new();
        tracker.discover(&deposit(0xbb, 0, 10));
        tracker.discover(&deposit(0xbb, 1, 10));
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn invalid_positions_are_rejected() {
        let tracker = PositionTracker::new();
        assert!(!tracker.discover(&deposit(0xbb, 2, 10)));
        assert!(!tracker.discover(&deposit(0x00, 0, 10)));
        assert!(tracker.is_empty());
    }

    #[test]
    fn non_deposit_log_is_ignored() {
        let tracker = PositionTracker::new();
        let log = market_created_log(
            contract(),
            B256::repeat_byte(1),
            Address::ZERO,
            B256::repeat_byte(2),
            2,
            0,
            0,
            5,
        );
        assert!(!tracker.discover(&log));
        assert!(tracker.is_empty());
    }

    #[test]
    fn set_only_grows_and_keeps_insertion_order() {
        let tracker = PositionTracker::new();
        let logs = [
            deposit(3, 0, 1),
            deposit(1, 1, 2),
            deposit(3, 0, 3),
            deposit(2, 0, 4),
            deposit(1, 1, 5),
            deposit(0, 1, 6),
        ];

        let mut previous: Vec<Position> = Vec::new();
        for log in &logs {
            tracker.discover(log);
            let snap = tracker.snapshot();
            assert!(snap.len() >= previous.len());
            assert_eq!(&snap[..previous.len()], previous.as_slice());
            previous = snap;
        }

        let expected: Vec<Position> = [(3, 0), (1, 1), (2, 0)]
            .into_iter()
            .map(|(c, o)| Position::new(B256::repeat_byte(c), o))
            .collect();
        assert_eq!(previous, expected);
    }
}
