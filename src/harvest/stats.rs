//! In-memory harvest metrics. The scheduler records, the API reads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use hdrhistogram::Histogram;
use serde::Serialize;

use crate::types::{CycleSummary, CycleTrigger, HarvestOutcome, HarvestStatus};

/// Compact, serializable form of the last cycle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub trigger: CycleTrigger,
    pub started_at: u64,
    pub duration_ms: u64,
    pub attempted: usize,
    pub harvested: usize,
    pub nothing_pending: usize,
    pub failed: usize,
    /// Decimal string, amounts are 256-bit.
    pub total_harvested: String,
}

impl From<&CycleSummary> for CycleReport {
    fn from(s: &CycleSummary) -> Self {
        Self {
            trigger: s.trigger,
            started_at: s.started_at_ms,
            duration_ms: duration_ms(s.duration),
            attempted: s.attempted(),
            harvested: s.harvested(),
            nothing_pending: s.nothing_pending(),
            failed: s.failed(),
            total_harvested: s.total_harvested().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestStatsSnapshot {
    pub cycles: u64,
    pub skipped_ticks: u64,
    pub harvested: u64,
    pub nothing_pending: u64,
    pub failed: u64,
    pub cycle_p50_ms: Option<u64>,
    pub cycle_p95_ms: Option<u64>,
    pub cycle_p99_ms: Option<u64>,
    pub last_cycle: Option<CycleReport>,
}

pub struct HarvestStats {
    /// Cycle durations in milliseconds. Tracks 1ms to 1h, 3 significant figures.
    durations: Mutex<Histogram<u64>>,
    last_cycle: Mutex<Option<CycleReport>>,
    cycles: AtomicU64,
    skipped_ticks: AtomicU64,
    harvested: AtomicU64,
    nothing_pending: AtomicU64,
    failed: AtomicU64,
}

impl HarvestStats {
    pub fn new() -> Self {
        let histogram = Histogram::new_with_bounds(1, 3_600_000, 3).expect("valid histogram bounds");
        Self {
            durations: Mutex::new(histogram),
            last_cycle: Mutex::new(None),
            cycles: AtomicU64::new(0),
            skipped_ticks: AtomicU64::new(0),
            harvested: AtomicU64::new(0),
            nothing_pending: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn record_outcome(&self, outcome: &HarvestOutcome) {
        let counter = match outcome.status {
            HarvestStatus::Harvested { .. } => &self.harvested,
            HarvestStatus::NothingPending => &self.nothing_pending,
            HarvestStatus::Failed { .. } => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished cycle. Per-position counters are updated here too.
    pub fn record_cycle(&self, summary: &CycleSummary) {
        for outcome in &summary.outcomes {
            self.record_outcome(outcome);
        }
        self.cycles.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut h) = self.durations.lock() {
            h.saturating_record(duration_ms(summary.duration).max(1));
        }
        if let Ok(mut last) = self.last_cycle.lock() {
            *last = Some(CycleReport::from(summary));
        }
    }

    pub fn record_skipped_tick(&self) {
        self.skipped_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> HarvestStatsSnapshot {
        let (p50, p95, p99) = match self.durations.lock() {
            Ok(h) if h.len() > 0 => (
                Some(h.value_at_quantile(0.5)),
                Some(h.value_at_quantile(0.95)),
                Some(h.value_at_quantile(0.99)),
            ),
            _ => (None, None, None),
        };
        HarvestStatsSnapshot {
            cycles: self.cycles(),
            skipped_ticks: self.skipped_ticks.load(Ordering::Relaxed),
            harvested: self.harvested.load(Ordering::Relaxed),
            nothing_pending: self.nothing_pending.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cycle_p50_ms: p50,
            cycle_p95_ms: p95,
            cycle_p99_ms: p99,
            last_cycle: self.last_cycle.lock().ok().and_then(|l| l.clone()),
        }
    }
}

impl Default for HarvestStats {
    fn default() -> Self {
        Self::new()
    }
}

fn duration_ms(d: Duration) -> u64 {
    d.as_millis().min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Position;
    use alloy::primitives::{B256, U256};

    #[test]
    fn empty_stats_have_no_percentiles() {
        let snap = HarvestStats::new().snapshot();
        assert_eq!(snap.cycles, 0);
        assert!(snap.cycle_p50_ms.is_none());
        assert!(snap.last_cycle.is_none());
    }

    #[test]
    fn cycle_updates_counters_and_last_report() {
        let stats = HarvestStats::new();
        let summary = CycleSummary {
            trigger: CycleTrigger::Timer,
            started_at_ms: 1_000,
            duration: Duration::from_millis(40),
            outcomes: vec![
                HarvestOutcome {
                    position: Position::new(B256::repeat_byte(1), 0),
                    status: HarvestStatus::Harvested { amount: U256::from(12) },
                },
                HarvestOutcome {
                    position: Position::new(B256::repeat_byte(2), 1),
                    status: HarvestStatus::NothingPending,
                },
            ],
        };
        stats.record_cycle(&summary);
        stats.record_skipped_tick();

        let snap = stats.snapshot();
        assert_eq!(snap.cycles, 1);
        assert_eq!(snap.skipped_ticks, 1);
        assert_eq!(snap.harvested, 1);
        assert_eq!(snap.nothing_pending, 1);
        assert!(snap.cycle_p99_ms.unwrap() >= 40);
        let last = snap.last_cycle.unwrap();
        assert_eq!(last.total_harvested, "12");
        assert_eq!(last.attempted, 2);
    }
}
