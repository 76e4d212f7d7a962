//! In-memory store that fails chosen operations on demand. Test-only.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::cache::{CacheStore, MemoryCacheStore};
use crate::error::{AppError, Result};

#[derive(Default)]
pub struct FlakyCacheStore {
    inner: MemoryCacheStore,
    /// Deletes still to fail before they start succeeding.
    failing_deletes: AtomicUsize,
    delete_calls: AtomicUsize,
    failing_gets: AtomicBool,
    failing_sets: Mutex<HashSet<String>>,
}

impl FlakyCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_deletes(&self, n: usize) {
        self.failing_deletes.store(n, Ordering::SeqCst);
    }

    pub fn fail_gets(&self, failing: bool) {
        self.failing_gets.store(failing, Ordering::SeqCst);
    }

    pub fn fail_set(&self, key: &str) {
        self.failing_sets.lock().unwrap().insert(key.to_string());
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CacheStore for FlakyCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if self.failing_gets.load(Ordering::SeqCst) {
            return Err(AppError::Cache(format!("get {key}: connection reset")));
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        if self.failing_sets.lock().unwrap().contains(key) {
            return Err(AppError::Cache(format!("set {key}: disk full")));
        }
        self.inner.set(key, value).await
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failing_deletes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(AppError::Cache("delete: connection reset".to_string()));
        }
        self.inner.delete(keys).await
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.scan_keys(prefix).await
    }

    async fn zset_add(&self, index: &str, score: f64, member: &str) -> Result<()> {
        self.inner.zset_add(index, score, member).await
    }

    async fn zset_reverse_range(&self, index: &str, start: isize, end: isize) -> Result<Vec<String>> {
        self.inner.zset_reverse_range(index, start, end).await
    }
}
