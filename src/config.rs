use alloy::primitives::Address;

use crate::error::{AppError, Result};

pub const RPC_URL: &str = "http://127.0.0.1:8545";
pub const WS_RPC_URL: &str = "ws://127.0.0.1:8546";

/// Blocks scanned behind the current head on startup. Kept under the 10k-block
/// `eth_getLogs` range cap most public RPC endpoints enforce.
pub const BACKFILL_WINDOW_BLOCKS: u64 = 10_000;

/// Harvest cycle period (seconds).
pub const HARVEST_INTERVAL_SECS: u64 = 300;

/// Bounded buffer between the live log feed and the indexer loop.
/// The feed awaits capacity when full instead of dropping batches.
pub const SUBSCRIPTION_BUFFER: usize = 256;

/// Heartbeat ping interval on the live feed (seconds).
pub const WS_PING_INTERVAL_SECS: u64 = 30;

/// Reconnect backoff values in milliseconds.
pub const RECONNECT_BACKOFF_MS: &[u64] = &[100, 200, 400, 800, 1600, 3200];

/// How long a harvest transaction may stay unconfirmed before the attempt fails.
pub const CONFIRMATION_TIMEOUT_SECS: u64 = 120;

/// Receipt polling interval while awaiting confirmation (milliseconds).
pub const RECEIPT_POLL_INTERVAL_MS: u64 = 1_000;

/// Wipe attempts on contract migration before startup proceeds anyway.
pub const MIGRATION_ATTEMPTS: usize = 3;

/// Cache key layout.
pub mod keys {
    pub const MARKET_PREFIX: &str = "market:";
    pub const MARKETS_BY_CREATED: &str = "markets:by_created";
    pub const CONTRACT_ADDRESS: &str = "meta:contract_address";
}

/// Which ChainClient implementation the composition root builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainProvider {
    Rpc,
    Mock,
}

impl std::str::FromStr for ChainProvider {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "rpc" => Ok(ChainProvider::Rpc),
            "mock" => Ok(ChainProvider::Mock),
            other => Err(AppError::Config(format!(
                "CHAIN_PROVIDER must be `rpc` or `mock`, got `{other}`"
            ))),
        }
    }
}

/// Which CacheStore implementation the composition root builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Sqlite,
    Memory,
}

impl std::str::FromStr for CacheBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sqlite" => Ok(CacheBackend::Sqlite),
            "memory" => Ok(CacheBackend::Memory),
            other => Err(AppError::Config(format!(
                "CACHE_BACKEND must be `sqlite` or `memory`, got `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub chain_provider: ChainProvider,
    pub rpc_url: String,
    pub ws_rpc_url: String,
    /// The monitored bribe-market contract (CONTRACT_ADDRESS).
    pub contract_address: Address,
    /// Hex private key used to sign harvest transactions (HARVESTER_PRIVATE_KEY).
    /// Required when `chain_provider` is `rpc`.
    pub harvester_private_key: Option<String>,
    pub cache_backend: CacheBackend,
    pub db_path: String,
    pub api_port: u16,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let chain_provider: ChainProvider = std::env::var("CHAIN_PROVIDER")
            .unwrap_or_else(|_| "rpc".to_string())
            .parse()?;

        let contract_address = std::env::var("CONTRACT_ADDRESS")
            .map_err(|_| AppError::Config("CONTRACT_ADDRESS must be set".to_string()))?
            .trim()
            .parse::<Address>()
            .map_err(|e| AppError::Config(format!("CONTRACT_ADDRESS is not a valid address: {e}")))?;

        let harvester_private_key = std::env::var("HARVESTER_PRIVATE_KEY")
            .ok()
            .filter(|s| !s.trim().is_empty());
        if chain_provider == ChainProvider::Rpc && harvester_private_key.is_none() {
            return Err(AppError::Config(
                "HARVESTER_PRIVATE_KEY must be set when CHAIN_PROVIDER=rpc".to_string(),
            ));
        }

        Ok(Self {
            chain_provider,
            rpc_url: std::env::var("RPC_URL").unwrap_or_else(|_| RPC_URL.to_string()),
            ws_rpc_url: std::env::var("WS_RPC_URL").unwrap_or_else(|_| WS_RPC_URL.to_string()),
            contract_address,
            harvester_private_key,
            cache_backend: std::env::var("CACHE_BACKEND")
                .unwrap_or_else(|_| "sqlite".to_string())
                .parse()?,
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "harvester.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_provider_parses_case_insensitively() {
        assert_eq!("RPC".parse::<ChainProvider>().unwrap(), ChainProvider::Rpc);
        assert_eq!(" mock ".parse::<ChainProvider>().unwrap(), ChainProvider::Mock);
        assert!("ganache".parse::<ChainProvider>().is_err());
    }

    #[test]
    fn cache_backend_rejects_unknown_values() {
        assert_eq!("sqlite".parse::<CacheBackend>().unwrap(), CacheBackend::Sqlite);
        assert_eq!("Memory".parse::<CacheBackend>().unwrap(), CacheBackend::Memory);
        assert!(matches!("redis".parse::<CacheBackend>(), Err(AppError::Config(_))));
    }
}
