//! Durable key/value + sorted-set store the indexer writes and the query
//! facade reads. Two backends: SQLite (default) and an in-memory map.

pub mod memory;
pub mod sqlite;

#[cfg(test)]
pub(crate) mod flaky;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::{CacheBackend, Config};
use crate::error::Result;

pub use memory::MemoryCacheStore;
pub use sqlite::SqliteCacheStore;

/// Per-key writes are atomic; nothing spans keys. A record write and its
/// sorted-set entry are two separate operations.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Removes each named key or sorted set. Returns how many existed.
    async fn delete(&self, keys: &[String]) -> Result<usize>;

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Adds `member` or updates its score.
    async fn zset_add(&self, index: &str, score: f64, member: &str) -> Result<()>;

    /// Members ordered by score descending (ties by member descending), sliced
    /// by inclusive `start..=end` ranks. Negative ranks count from the end, so
    /// `(0, -1)` is the whole set.
    async fn zset_reverse_range(&self, index: &str, start: isize, end: isize) -> Result<Vec<String>>;
}

/// Build the configured backend.
pub async fn connect(cfg: &Config) -> Result<Arc<dyn CacheStore>> {
    match cfg.cache_backend {
        CacheBackend::Sqlite => {
            let store = SqliteCacheStore::connect(&cfg.db_path).await?;
            info!("Cache store ready (sqlite at {})", cfg.db_path);
            Ok(Arc::new(store))
        }
        CacheBackend::Memory => {
            info!("Cache store ready (in-memory, not durable)");
            Ok(Arc::new(MemoryCacheStore::new()))
        }
    }
}

/// Resolve inclusive, possibly negative ranks against a set of `len` members.
/// Returns `None` when the range selects nothing.
pub(crate) fn resolve_rank_range(len: usize, start: isize, end: isize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len_i = len as isize;
    let start = if start < 0 { (len_i + start).max(0) } else { start };
    let end = if end < 0 { len_i + end } else { end.min(len_i - 1) };
    if start > end || start >= len_i || end < 0 {
        return None;
    }
    Some((start as usize, end as usize))
}
