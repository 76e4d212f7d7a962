use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use alloy::primitives::{keccak256, Address, TxHash, B256, U256};
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::chain::{event_signature, ChainClient, LogSubscription, ReceiptStatus, SubscriptionEvent};
use crate::config::SUBSCRIPTION_BUFFER;
use crate::contracts::IBribeMarket;
use crate::error::{AppError, Result};
use crate::types::{BribePoolView, Position};

struct Subscriber {
    address: Address,
    events: Vec<B256>,
    tx: mpsc::Sender<SubscriptionEvent>,
}

#[derive(Default)]
struct Ledger {
    height: u64,
    logs: Vec<Log>,
    pending: HashMap<Position, U256>,
    /// Positions whose pending-rewards read errors with the given message.
    failing_reads: HashMap<Position, String>,
    /// Positions whose harvest transaction is mined but reverts.
    reverting: HashSet<Position>,
    bribe_pools: HashMap<Position, Vec<BribePoolView>>,
    bribe_failure: Option<String>,
    submitted: HashMap<TxHash, Position>,
    subscribers: Vec<Subscriber>,
    /// When set, every pending-rewards read waits for one permit.
    pending_gate: Option<Arc<Notify>>,
    nonce: u64,
}

/// In-memory ledger implementing [`ChainClient`]. Tests seed it directly;
/// `CHAIN_PROVIDER=mock` runs start it empty.
///
/// A confirmed harvest zeroes the position's pending rewards, like the contract.
#[derive(Default)]
pub struct MockChainClient {
    ledger: Mutex<Ledger>,
    harvest_calls: AtomicUsize,
    pending_reads: AtomicUsize,
}

impl MockChainClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_height(&self, height: u64) {
        self.ledger().height = height;
    }

    /// Record a historical log, raising the height to its block if needed.
    pub fn push_log(&self, log: Log) {
        let mut ledger = self.ledger();
        if let Some(block) = log.block_number {
            ledger.height = ledger.height.max(block);
        }
        ledger.logs.push(log);
    }

    /// Record `logs` and deliver them as one batch to every matching subscriber.
    pub async fn emit(&self, logs: Vec<Log>) {
        let targets: Vec<(mpsc::Sender<SubscriptionEvent>, Vec<Log>)> = {
            let mut ledger = self.ledger();
            for log in &logs {
                if let Some(block) = log.block_number {
                    ledger.height = ledger.height.max(block);
                }
                ledger.logs.push(log.clone());
            }
            ledger.subscribers.retain(|s| !s.tx.is_closed());
            ledger
                .subscribers
                .iter()
                .map(|s| {
                    let matching: Vec<Log> = logs
                        .iter()
                        .filter(|l| {
                            l.inner.address == s.address
                                && event_signature(l).is_some_and(|sig| s.events.contains(&sig))
                        })
                        .cloned()
                        .collect();
                    (s.tx.clone(), matching)
                })
                .filter(|(_, matching)| !matching.is_empty())
                .collect()
        };

        for (tx, batch) in targets {
            let _ = tx.send(SubscriptionEvent::Logs(batch)).await;
        }
    }

    /// Tell every live subscriber its feed dropped and came back. Logs pushed
    /// with [`push_log`](Self::push_log) meanwhile are only reachable through
    /// `get_logs`.
    pub async fn signal_reconnect(&self) {
        let targets: Vec<mpsc::Sender<SubscriptionEvent>> = {
            let mut ledger = self.ledger();
            ledger.subscribers.retain(|s| !s.tx.is_closed());
            ledger.subscribers.iter().map(|s| s.tx.clone()).collect()
        };
        for tx in targets {
            let _ = tx.send(SubscriptionEvent::Reconnected).await;
        }
    }

    pub fn set_pending(&self, position: Position, amount: U256) {
        self.ledger().pending.insert(position, amount);
    }

    pub fn fail_pending_read(&self, position: Position, message: &str) {
        self.ledger().failing_reads.insert(position, message.to_string());
    }

    /// Hold every pending-rewards read until the returned handle is notified,
    /// one read per `notify_one`.
    pub fn gate_pending_reads(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.ledger().pending_gate = Some(gate.clone());
        gate
    }

    pub fn revert_harvest(&self, position: Position) {
        self.ledger().reverting.insert(position);
    }

    pub fn add_bribe_pool(&self, pool: BribePoolView) {
        let position = Position::new(pool.condition_id, pool.outcome);
        self.ledger().bribe_pools.entry(position).or_default().push(pool);
    }

    pub fn fail_bribe_reads(&self, message: &str) {
        self.ledger().bribe_failure = Some(message.to_string());
    }

    /// Number of state-changing harvest calls issued.
    pub fn harvest_calls(&self) -> usize {
        self.harvest_calls.load(Ordering::SeqCst)
    }

    pub fn pending_reads(&self) -> usize {
        self.pending_reads.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        let mut ledger = self.ledger();
        ledger.subscribers.retain(|s| !s.tx.is_closed());
        ledger.subscribers.len()
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn current_height(&self) -> Result<u64> {
        Ok(self.ledger().height)
    }

    async fn get_logs(&self, address: Address, event: B256, from_block: u64, to_block: u64) -> Result<Vec<Log>> {
        let ledger = self.ledger();
        Ok(ledger
            .logs
            .iter()
            .filter(|l| l.inner.address == address && event_signature(l) == Some(event))
            .filter(|l| {
                let block = l.block_number.unwrap_or(0);
                block >= from_block && block <= to_block
            })
            .cloned()
            .collect())
    }

    async fn subscribe(&self, address: Address, events: &[B256]) -> Result<LogSubscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.ledger().subscribers.push(Subscriber {
            address,
            events: events.to_vec(),
            tx,
        });
        Ok(LogSubscription::new(rx, CancellationToken::new(), None))
    }

    async fn pending_rewards(&self, _contract: Address, position: Position) -> Result<U256> {
        self.pending_reads.fetch_add(1, Ordering::SeqCst);
        let gate = self.ledger().pending_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let ledger = self.ledger();
        if let Some(message) = ledger.failing_reads.get(&position) {
            return Err(AppError::Chain(message.clone()));
        }
        Ok(ledger.pending.get(&position).copied().unwrap_or(U256::ZERO))
    }

    async fn submit_harvest(&self, _contract: Address, position: Position) -> Result<TxHash> {
        self.harvest_calls.fetch_add(1, Ordering::SeqCst);
        let mut ledger = self.ledger();
        ledger.nonce += 1;
        let tx_hash = keccak256(ledger.nonce.to_be_bytes());
        ledger.submitted.insert(tx_hash, position);
        Ok(tx_hash)
    }

    async fn await_confirmation(&self, tx_hash: TxHash) -> Result<ReceiptStatus> {
        let mut ledger = self.ledger();
        let position = ledger
            .submitted
            .remove(&tx_hash)
            .ok_or_else(|| AppError::Chain(format!("unknown transaction {tx_hash}")))?;
        ledger.height += 1;
        if ledger.reverting.contains(&position) {
            return Ok(ReceiptStatus::Failed);
        }
        ledger.pending.insert(position, U256::ZERO);
        Ok(ReceiptStatus::Success)
    }

    async fn bribe_pool_ids(&self, _contract: Address, position: Position) -> Result<Vec<U256>> {
        let ledger = self.ledger();
        if let Some(message) = &ledger.bribe_failure {
            return Err(AppError::Chain(message.clone()));
        }
        Ok(ledger
            .bribe_pools
            .get(&position)
            .map(|pools| pools.iter().map(|p| p.id).collect())
            .unwrap_or_default())
    }

    async fn bribe_pool(&self, _contract: Address, pool_id: U256) -> Result<BribePoolView> {
        let ledger = self.ledger();
        if let Some(message) = &ledger.bribe_failure {
            return Err(AppError::Chain(message.clone()));
        }
        ledger
            .bribe_pools
            .values()
            .flatten()
            .find(|p| p.id == pool_id)
            .cloned()
            .ok_or_else(|| AppError::Chain(format!("no bribe pool {pool_id}")))
    }
}

// ---------------------------------------------------------------------------
// Log builders
// ---------------------------------------------------------------------------

/// Wrap an encoded event as an RPC log mined in `block_number`.
pub fn encode_log<E: SolEvent>(contract: Address, event: &E, block_number: u64) -> Log {
    let data = event.encode_log_data();
    let mut preimage = block_number.to_be_bytes().to_vec();
    preimage.extend_from_slice(&data.data);
    for topic in data.topics() {
        preimage.extend_from_slice(topic.as_slice());
    }
    Log {
        inner: alloy::primitives::Log { address: contract, data },
        block_number: Some(block_number),
        transaction_hash: Some(keccak256(&preimage)),
        log_index: Some(0),
        ..Default::default()
    }
}

#[allow(clippy::too_many_arguments)]
pub fn market_created_log(
    contract: Address,
    condition_id: B256,
    oracle: Address,
    question_id: B256,
    outcome_slot_count: u64,
    start_time: u64,
    end_time: u64,
    block_number: u64,
) -> Log {
    let event = IBribeMarket::MarketCreated {
        conditionId: condition_id,
        oracle,
        questionId: question_id,
        outcomeSlotCount: U256::from(outcome_slot_count),
        startTime: start_time,
        endTime: end_time,
    };
    encode_log(contract, &event, block_number)
}

pub fn deposited_log(contract: Address, position: Position, account: Address, amount: U256, block_number: u64) -> Log {
    let event = IBribeMarket::Deposited {
        conditionId: position.condition_id,
        outcome: position.outcome,
        account,
        amount,
    };
    encode_log(contract, &event, block_number)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract() -> Address {
        Address::repeat_byte(0xc0)
    }

    #[tokio::test]
    async fn get_logs_filters_by_address_signature_and_range() {
        let chain = MockChainClient::new();
        let pos = Position::new(B256::repeat_byte(1), 0);
        chain.push_log(deposited_log(contract(), pos, Address::ZERO, U256::from(1), 5));
        chain.push_log(deposited_log(contract(), pos, Address::ZERO, U256::from(1), 50));
        chain.push_log(deposited_log(Address::repeat_byte(0xdd), pos, Address::ZERO, U256::from(1), 6));

        let sig = IBribeMarket::Deposited::SIGNATURE_HASH;
        assert_eq!(chain.current_height().await.unwrap(), 50);
        assert_eq!(chain.get_logs(contract(), sig, 0, 10).await.unwrap().len(), 1);
        assert_eq!(chain.get_logs(contract(), sig, 0, 50).await.unwrap().len(), 2);
        let other = IBribeMarket::MarketCreated::SIGNATURE_HASH;
        assert!(chain.get_logs(contract(), other, 0, 50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn emit_reaches_matching_subscribers_only() {
        let chain = MockChainClient::new();
        let sig = IBribeMarket::Deposited::SIGNATURE_HASH;
        let mut sub = chain.subscribe(contract(), &[sig]).await.unwrap();
        let mut other = chain
            .subscribe(contract(), &[IBribeMarket::MarketCreated::SIGNATURE_HASH])
            .await
            .unwrap();

        let pos = Position::new(B256::repeat_byte(2), 1);
        chain
            .emit(vec![deposited_log(contract(), pos, Address::ZERO, U256::from(3), 9)])
            .await;

        match sub.next_event().await {
            Some(SubscriptionEvent::Logs(batch)) => assert_eq!(batch.len(), 1),
            other => panic!("expected a log batch, got {other:?}"),
        }
        assert!(other.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reconnect_is_signalled_without_replaying_logs() {
        let chain = MockChainClient::new();
        let sig = IBribeMarket::Deposited::SIGNATURE_HASH;
        let mut sub = chain.subscribe(contract(), &[sig]).await.unwrap();

        let pos = Position::new(B256::repeat_byte(5), 0);
        chain.push_log(deposited_log(contract(), pos, Address::ZERO, U256::from(1), 12));
        chain.signal_reconnect().await;

        assert!(matches!(sub.next_event().await, Some(SubscriptionEvent::Reconnected)));
        assert!(sub.rx.try_recv().is_err());
        assert_eq!(chain.get_logs(contract(), sig, 0, 12).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn gated_reads_wait_for_a_permit() {
        let chain = Arc::new(MockChainClient::new());
        let pos = Position::new(B256::repeat_byte(6), 1);
        chain.set_pending(pos, U256::from(4));
        let gate = chain.gate_pending_reads();

        let read = tokio::spawn({
            let chain = chain.clone();
            async move { chain.pending_rewards(contract(), pos).await }
        });
        tokio::task::yield_now().await;
        assert!(!read.is_finished());

        gate.notify_one();
        assert_eq!(read.await.unwrap().unwrap(), U256::from(4));
    }

    #[tokio::test]
    async fn confirmed_harvest_clears_pending() {
        let chain = MockChainClient::new();
        let pos = Position::new(B256::repeat_byte(3), 0);
        chain.set_pending(pos, U256::from(10));

        let tx = chain.submit_harvest(contract(), pos).await.unwrap();
        assert_eq!(chain.await_confirmation(tx).await.unwrap(), ReceiptStatus::Success);
        assert_eq!(chain.pending_rewards(contract(), pos).await.unwrap(), U256::ZERO);
        assert_eq!(chain.harvest_calls(), 1);
    }

    #[tokio::test]
    async fn reverted_harvest_keeps_pending() {
        let chain = MockChainClient::new();
        let pos = Position::new(B256::repeat_byte(4), 1);
        chain.set_pending(pos, U256::from(10));
        chain.revert_harvest(pos);

        let tx = chain.submit_harvest(contract(), pos).await.unwrap();
        assert_eq!(chain.await_confirmation(tx).await.unwrap(), ReceiptStatus::Failed);
        assert_eq!(chain.pending_rewards(contract(), pos).await.unwrap(), U256::from(10));
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned() {
        let chain = MockChainClient::new();
        let sub = chain
            .subscribe(contract(), &[IBribeMarket::Deposited::SIGNATURE_HASH])
            .await
            .unwrap();
        assert_eq!(chain.subscriber_count(), 1);
        sub.close().await;
        assert_eq!(chain.subscriber_count(), 0);
    }
}
