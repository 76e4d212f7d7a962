use std::time::Duration;

use alloy::network::{EthereumWallet, ReceiptResponse};
use alloy::primitives::{Address, TxHash, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::chain::subscription::LogFeed;
use crate::chain::{ChainClient, LogSubscription, ReceiptStatus};
use crate::config::{CONFIRMATION_TIMEOUT_SECS, RECEIPT_POLL_INTERVAL_MS, SUBSCRIPTION_BUFFER};
use crate::contracts::IBribeMarket;
use crate::error::{AppError, Result};
use crate::types::{BribePoolView, Position};

/// JSON-RPC backed client. Reads, log queries and signed harvest transactions
/// go over HTTP; live logs come from a separate WebSocket feed.
pub struct RpcChainClient {
    provider: DynProvider,
    ws_url: String,
}

impl RpcChainClient {
    pub fn connect(rpc_url: &str, ws_url: &str, private_key: &str) -> Result<Self> {
        let signer: PrivateKeySigner = private_key
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("HARVESTER_PRIVATE_KEY is invalid: {e}")))?;
        let url = rpc_url
            .parse()
            .map_err(|e| AppError::Config(format!("RPC_URL is invalid: {e}")))?;

        info!(harvester = %signer.address(), "Harvest transactions will be signed locally");

        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(url)
            .erased();

        Ok(Self {
            provider,
            ws_url: ws_url.to_string(),
        })
    }

    fn market(&self, contract: Address) -> IBribeMarket::IBribeMarketInstance<DynProvider> {
        IBribeMarket::new(contract, self.provider.clone())
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn current_height(&self) -> Result<u64> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn get_logs(&self, address: Address, event: B256, from_block: u64, to_block: u64) -> Result<Vec<Log>> {
        let filter = Filter::new()
            .address(address)
            .event_signature(event)
            .from_block(from_block)
            .to_block(to_block);
        Ok(self.provider.get_logs(&filter).await?)
    }

    async fn subscribe(&self, address: Address, events: &[B256]) -> Result<LogSubscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = CancellationToken::new();
        let feed = LogFeed::new(self.ws_url.clone(), address, events.to_vec(), tx, cancel.clone());
        let task = tokio::spawn(async move { feed.run().await });
        Ok(LogSubscription::new(rx, cancel, Some(task)))
    }

    async fn pending_rewards(&self, contract: Address, position: Position) -> Result<U256> {
        let pending = self
            .market(contract)
            .pendingRewards(position.condition_id, position.outcome)
            .call()
            .await?;
        Ok(pending)
    }

    async fn submit_harvest(&self, contract: Address, position: Position) -> Result<TxHash> {
        let pending_tx = self
            .market(contract)
            .harvest(position.condition_id, position.outcome)
            .send()
            .await?;
        let tx_hash = *pending_tx.tx_hash();
        debug!(position = %position, tx = %tx_hash, "Harvest transaction sent");
        Ok(tx_hash)
    }

    async fn await_confirmation(&self, tx_hash: TxHash) -> Result<ReceiptStatus> {
        let deadline = Instant::now() + Duration::from_secs(CONFIRMATION_TIMEOUT_SECS);
        loop {
            if let Some(receipt) = self.provider.get_transaction_receipt(tx_hash).await? {
                return Ok(if receipt.status() {
                    ReceiptStatus::Success
                } else {
                    ReceiptStatus::Failed
                });
            }
            if Instant::now() >= deadline {
                return Err(AppError::ConfirmationTimeout(tx_hash.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(RECEIPT_POLL_INTERVAL_MS)).await;
        }
    }

    async fn bribe_pool_ids(&self, contract: Address, position: Position) -> Result<Vec<U256>> {
        let ids = self
            .market(contract)
            .getBribePoolIds(position.condition_id, position.outcome)
            .call()
            .await?;
        Ok(ids)
    }

    async fn bribe_pool(&self, contract: Address, pool_id: U256) -> Result<BribePoolView> {
        let pool = self.market(contract).getBribePool(pool_id).call().await?;
        Ok(BribePoolView {
            id: pool.id,
            sponsor: pool.sponsor,
            token: pool.token,
            total_amount: pool.totalAmount,
            start_time: pool.startTime,
            end_time: pool.endTime,
            condition_id: pool.conditionId,
            outcome: pool.outcome,
        })
    }
}
