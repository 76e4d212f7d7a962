pub mod event_indexer;
pub mod migration;

pub use event_indexer::{BackfillReport, EventIndexer};
pub use migration::{MigrationGuard, MigrationOutcome};
