use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::cache::{resolve_rank_range, CacheStore};
use crate::error::Result;

/// Non-durable backend. Used by tests and `CHAIN_PROVIDER=mock` development runs.
#[derive(Default)]
pub struct MemoryCacheStore {
    /// key → serialized record
    kv: DashMap<String, Vec<u8>>,
    /// sorted-set name → (member → score)
    zsets: DashMap<String, HashMap<String, f64>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.kv.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.kv.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        let mut removed = 0;
        for key in keys {
            if self.kv.remove(key).is_some() {
                removed += 1;
            }
            if self.zsets.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .kv
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn zset_add(&self, index: &str, score: f64, member: &str) -> Result<()> {
        self.zsets
            .entry(index.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zset_reverse_range(&self, index: &str, start: isize, end: isize) -> Result<Vec<String>> {
        let Some(set) = self.zsets.get(index) else {
            return Ok(Vec::new());
        };
        let mut entries: Vec<(String, f64)> =
            set.iter().map(|(m, s)| (m.clone(), *s)).collect();
        drop(set);

        entries.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

        let Some((from, to)) = resolve_rank_range(entries.len(), start, end) else {
            return Ok(Vec::new());
        };
        Ok(entries[from..=to].iter().map(|(m, _)| m.clone()).collect())
    }
}
