//! Capability over the remote ledger. The composition root picks one
//! implementation from config and injects it into every component.

pub mod messages;
pub mod mock;
pub mod rpc;
pub mod subscription;

use std::sync::Arc;

use alloy::primitives::{Address, TxHash, B256, U256};
use alloy::rpc::types::Log;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{ChainProvider, Config};
use crate::error::{AppError, Result};
use crate::types::{BribePoolView, Position};

pub use mock::MockChainClient;
pub use rpc::RpcChainClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    Success,
    Failed,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn current_height(&self) -> Result<u64>;

    /// Logs emitted by `address` whose first topic is `event`, inclusive range.
    async fn get_logs(&self, address: Address, event: B256, from_block: u64, to_block: u64) -> Result<Vec<Log>>;

    /// Live logs emitted by `address` matching any of `events`.
    async fn subscribe(&self, address: Address, events: &[B256]) -> Result<LogSubscription>;

    async fn pending_rewards(&self, contract: Address, position: Position) -> Result<U256>;

    /// Sends the harvest transaction; returns once it is accepted by the node.
    async fn submit_harvest(&self, contract: Address, position: Position) -> Result<TxHash>;

    async fn await_confirmation(&self, tx_hash: TxHash) -> Result<ReceiptStatus>;

    async fn bribe_pool_ids(&self, contract: Address, position: Position) -> Result<Vec<U256>>;

    async fn bribe_pool(&self, contract: Address, pool_id: U256) -> Result<BribePoolView>;
}

/// What a live feed delivers.
#[derive(Debug)]
pub enum SubscriptionEvent {
    Logs(Vec<Log>),
    /// The feed re-established its subscription after losing it. Logs mined
    /// while it was down were not delivered.
    Reconnected,
}

/// Receiving end of a live log feed. Events arrive through a bounded channel;
/// the producer waits for capacity rather than dropping.
///
/// Dropping the subscription cancels the producer, so every exit path of the
/// consumer releases it.
pub struct LogSubscription {
    rx: mpsc::Receiver<SubscriptionEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl LogSubscription {
    pub fn new(
        rx: mpsc::Receiver<SubscriptionEvent>,
        cancel: CancellationToken,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self { rx, cancel, task }
    }

    /// Next event, or `None` once the producer has stopped.
    pub async fn next_event(&mut self) -> Option<SubscriptionEvent> {
        self.rx.recv().await
    }

    /// Stop the producer and wait for it to exit.
    pub async fn close(mut self) {
        self.cancel.cancel();
        self.rx.close();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// First topic of a log (the event signature hash), if any.
pub fn event_signature(log: &Log) -> Option<B256> {
    log.inner.data.topics().first().copied()
}

/// Build the configured chain client.
pub async fn connect(cfg: &Config) -> Result<Arc<dyn ChainClient>> {
    match cfg.chain_provider {
        ChainProvider::Rpc => {
            let key = cfg.harvester_private_key.as_deref().ok_or_else(|| {
                AppError::Config("HARVESTER_PRIVATE_KEY must be set when CHAIN_PROVIDER=rpc".to_string())
            })?;
            let client = RpcChainClient::connect(&cfg.rpc_url, &cfg.ws_rpc_url, key)?;
            let height = client.current_height().await?;
            info!(height, "Chain client ready ({})", cfg.rpc_url);
            Ok(Arc::new(client))
        }
        ChainProvider::Mock => {
            info!("Chain client ready (in-memory mock ledger)");
            Ok(Arc::new(MockChainClient::new()))
        }
    }
}
