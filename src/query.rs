//! Read side for external callers. Markets come from the cache; bribe pools
//! are read live from the chain on every call.

use std::sync::Arc;

use alloy::primitives::{Address, B256};
use tracing::warn;

use crate::cache::CacheStore;
use crate::chain::ChainClient;
use crate::config::keys;
use crate::error::Result;
use crate::types::{condition_key, BribePoolView, BribePools, IndexedMarket, Position};

pub struct QueryFacade {
    chain: Arc<dyn ChainClient>,
    cache: Arc<dyn CacheStore>,
    contract: Address,
}

impl QueryFacade {
    pub fn new(chain: Arc<dyn ChainClient>, cache: Arc<dyn CacheStore>, contract: Address) -> Self {
        Self { chain, cache, contract }
    }

    /// Newest markets first. Index entries whose record is missing or
    /// unreadable are skipped. A failed index read yields an empty list.
    pub async fn list_markets(&self, limit: Option<usize>) -> Vec<IndexedMarket> {
        match self.try_list_markets(limit).await {
            Ok(markets) => markets,
            Err(e) => {
                warn!("Listing markets failed: {e}");
                Vec::new()
            }
        }
    }

    async fn try_list_markets(&self, limit: Option<usize>) -> Result<Vec<IndexedMarket>> {
        let end = match limit {
            Some(0) => return Ok(Vec::new()),
            Some(n) => isize::try_from(n).unwrap_or(isize::MAX) - 1,
            None => -1,
        };
        let ids = self
            .cache
            .zset_reverse_range(keys::MARKETS_BY_CREATED, 0, end)
            .await?;

        let mut markets = Vec::with_capacity(ids.len());
        for id in ids {
            match self.read_market(&id).await {
                Ok(Some(market)) => markets.push(market),
                Ok(None) => {}
                Err(e) => warn!(market = %id, "Skipping unreadable market record: {e}"),
            }
        }
        Ok(markets)
    }

    pub async fn get_market(&self, condition_id: B256) -> Option<IndexedMarket> {
        let id = condition_key(&condition_id);
        match self.read_market(&id).await {
            Ok(market) => market,
            Err(e) => {
                warn!(market = %id, "Reading market failed: {e}");
                None
            }
        }
    }

    async fn read_market(&self, id: &str) -> Result<Option<IndexedMarket>> {
        let key = format!("{}{id}", keys::MARKET_PREFIX);
        match self.cache.get(&key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Pools sponsoring `position`. `available` is false when the chain could
    /// not be read.
    pub async fn get_bribe_pools(&self, position: Position) -> BribePools {
        match self.try_bribe_pools(position).await {
            Ok(pools) => BribePools { pools, available: true },
            Err(e) => {
                warn!(position = %position, "Bribe pool lookup failed: {e}");
                BribePools::default()
            }
        }
    }

    async fn try_bribe_pools(&self, position: Position) -> Result<Vec<BribePoolView>> {
        let ids = self.chain.bribe_pool_ids(self.contract, position).await?;
        let mut pools = Vec::with_capacity(ids.len());
        for id in ids {
            pools.push(self.chain.bribe_pool(self.contract, id).await?);
        }
        Ok(pools)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;
    use crate::chain::MockChainClient;
    use alloy::primitives::U256;

    fn contract() -> Address {
        Address::repeat_byte(0xfa)
    }

    fn market(byte: u8, created_at: u64) -> IndexedMarket {
        IndexedMarket {
            condition_id: B256::repeat_byte(byte),
            oracle: Address::repeat_byte(0x01),
            question_id: B256::repeat_byte(0x02),
            outcome_slot_count: 2,
            block_number: 10,
            transaction_hash: B256::repeat_byte(0x03),
            created_at,
            start_time: 0,
            end_time: 0,
        }
    }

    async fn store(cache: &Arc<dyn CacheStore>, m: &IndexedMarket) {
        let id = condition_key(&m.condition_id);
        cache
            .set(&format!("{}{id}", keys::MARKET_PREFIX), &serde_json::to_vec(m).unwrap())
            .await
            .unwrap();
        cache
            .zset_add(keys::MARKETS_BY_CREATED, m.created_at as f64, &id)
            .await
            .unwrap();
    }

    fn facade(chain: Arc<MockChainClient>, cache: Arc<dyn CacheStore>) -> QueryFacade {
        QueryFacade::new(chain, cache, contract())
    }

    #[tokio::test]
    async fn lists_newest_first_and_honours_limit() {
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());
        for (byte, at) in [(1, 100), (2, 300), (3, 200)] {
            store(&cache, &market(byte, at)).await;
        }
        let q = facade(Arc::new(MockChainClient::new()), cache);

        let all: Vec<u64> = q.list_markets(None).await.iter().map(|m| m.created_at).collect();
        assert_eq!(all, vec![300, 200, 100]);
        assert_eq!(q.list_markets(Some(2)).await.len(), 2);
        assert!(q.list_markets(Some(0)).await.is_empty());
    }

    #[tokio::test]
    async fn index_entries_without_records_are_skipped() {
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());
        store(&cache, &market(1, 100)).await;
        cache
            .zset_add(keys::MARKETS_BY_CREATED, 500.0, &condition_key(&B256::repeat_byte(9)))
            .await
            .unwrap();
        let q = facade(Arc::new(MockChainClient::new()), cache);

        let listed = q.list_markets(None).await;
        assert_eq!(listed, vec![market(1, 100)]);
    }

    #[tokio::test]
    async fn corrupt_record_does_not_hide_the_rest() {
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());
        store(&cache, &market(1, 100)).await;
        let bad = condition_key(&B256::repeat_byte(2));
        cache
            .set(&format!("{}{bad}", keys::MARKET_PREFIX), b"not json")
            .await
            .unwrap();
        cache.zset_add(keys::MARKETS_BY_CREATED, 200.0, &bad).await.unwrap();
        let q = facade(Arc::new(MockChainClient::new()), cache);

        assert_eq!(q.list_markets(None).await, vec![market(1, 100)]);
        assert_eq!(q.get_market(B256::repeat_byte(2)).await, None);
    }

    #[tokio::test]
    async fn get_market_returns_none_when_absent() {
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCacheStore::new());
        store(&cache, &market(1, 100)).await;
        let q = facade(Arc::new(MockChainClient::new()), cache);

        assert_eq!(q.get_market(B256::repeat_byte(1)).await, Some(market(1, 100)));
        assert_eq!(q.get_market(B256::repeat_byte(2)).await, None);
    }

    #[tokio::test]
    async fn bribe_pools_are_read_live() {
        let chain = Arc::new(MockChainClient::new());
        let position = Position::new(B256::repeat_byte(4), 1);
        chain.add_bribe_pool(BribePoolView {
            id: U256::from(7),
            sponsor: Address::repeat_byte(5),
            token: Address::repeat_byte(6),
            total_amount: U256::from(1_000),
            start_time: 1,
            end_time: 2,
            condition_id: position.condition_id,
            outcome: 1,
        });
        let q = facade(chain, Arc::new(MemoryCacheStore::new()));

        let found = q.get_bribe_pools(position).await;
        assert!(found.available);
        assert_eq!(found.pools.len(), 1);
        assert_eq!(found.pools[0].total_amount, U256::from(1_000));

        let none = q.get_bribe_pools(Position::new(B256::repeat_byte(4), 0)).await;
        assert!(none.available);
        assert!(none.pools.is_empty());
    }

    #[tokio::test]
    async fn bribe_failure_is_flagged_unavailable() {
        let chain = Arc::new(MockChainClient::new());
        chain.fail_bribe_reads("rpc down");
        let q = facade(chain, Arc::new(MemoryCacheStore::new()));

        let result = q.get_bribe_pools(Position::new(B256::repeat_byte(4), 0)).await;
        assert!(!result.available);
        assert!(result.pools.is_empty());
    }
}
