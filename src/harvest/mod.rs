pub mod scheduler;
pub mod stats;

pub use scheduler::{HarvestScheduler, SchedulerState};
pub use stats::{HarvestStats, HarvestStatsSnapshot};
