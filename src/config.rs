//! Collection sync configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metadata::DetailFetchPolicy;
use crate::sync::{ReconcilePolicy, ScanPolicy, SyncPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// JSON-RPC endpoint
    #[serde(default)]
    pub rpc_url: Option<String>,

    /// Card NFT contract
    #[serde(default)]
    pub card_contract: Option<Address>,

    /// Pack manager contract, needed only for pending pack queries
    #[serde(default)]
    pub pack_contract: Option<Address>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: None,
            card_contract: None,
            pack_contract: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Widest log query the provider accepts, in blocks
    #[serde(default = "default_max_window")]
    pub max_window: u64,

    /// Empty windows in a row that end a full scan early
    #[serde(default = "default_max_consecutive_empty")]
    pub max_consecutive_empty: u32,

    /// Hard cap on window queries per scan
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    #[serde(default = "default_rate_limit_retries")]
    pub rate_limit_retries: u32,

    #[serde(default = "default_rate_limit_backoff")]
    pub rate_limit_backoff_ms: u64,

    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Successful windows in a row before a narrowed window doubles again (0 disables)
    #[serde(default = "default_widen_after")]
    pub widen_after: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_window: default_max_window(),
            max_consecutive_empty: default_max_consecutive_empty(),
            max_iterations: default_max_iterations(),
            rate_limit_retries: default_rate_limit_retries(),
            rate_limit_backoff_ms: default_rate_limit_backoff(),
            call_timeout_secs: default_call_timeout(),
            widen_after: default_widen_after(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Largest balance deficit repaired with point ownership checks
    #[serde(default = "default_max_deficit")]
    pub max_deficit: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_deficit: default_max_deficit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding checkpoints.db
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Checkpoints older than this many blocks trigger a full rescan
    #[serde(default = "default_max_incremental_gap")]
    pub max_incremental_gap: u64,

    /// Block the card contract was deployed at
    #[serde(default)]
    pub genesis_block: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_incremental_gap: default_max_incremental_gap(),
            genesis_block: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Mirror gateways for ipfs:// URIs, tried in order
    #[serde(default = "default_gateways")]
    pub gateways: Vec<String>,

    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_pause")]
    pub batch_pause_ms: u64,

    #[serde(default = "default_retry_rounds")]
    pub retry_rounds: u32,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            gateways: default_gateways(),
            fetch_timeout_secs: default_fetch_timeout(),
            batch_size: default_batch_size(),
            batch_pause_ms: default_batch_pause(),
            retry_rounds: default_retry_rounds(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

// Defaults
fn default_request_timeout() -> u64 { 30 }
fn default_max_window() -> u64 { 9000 }
fn default_max_consecutive_empty() -> u32 { 5 }
fn default_max_iterations() -> u32 { 500 }
fn default_rate_limit_retries() -> u32 { 3 }
fn default_rate_limit_backoff() -> u64 { 500 }
fn default_call_timeout() -> u64 { 15 }
fn default_widen_after() -> u32 { 8 }
fn default_max_deficit() -> u64 { 20 }
fn default_data_dir() -> PathBuf { PathBuf::from("./collection-data") }
fn default_max_incremental_gap() -> u64 { 50_000 }
fn default_fetch_timeout() -> u64 { 10 }
fn default_batch_size() -> usize { 10 }
fn default_batch_pause() -> u64 { 250 }
fn default_retry_rounds() -> u32 { 3 }
fn default_retry_delay() -> u64 { 2000 }
fn default_gateways() -> Vec<String> {
    vec![
        "https://ipfs.io".to_string(),
        "https://cloudflare-ipfs.com".to_string(),
        "https://gateway.pinata.cloud".to_string(),
    ]
}

impl Config {
    /// Read `path`, or fall back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// RPC endpoint and card contract, both required to talk to a ledger.
    pub fn ledger_endpoint(&self) -> Result<(&str, Address), ConfigError> {
        let rpc_url = self
            .ledger
            .rpc_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or(ConfigError::Missing("ledger.rpc_url"))?;
        let card_contract = self
            .ledger
            .card_contract
            .ok_or(ConfigError::Missing("ledger.card_contract"))?;
        Ok((rpc_url, card_contract))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.ledger.request_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata.fetch_timeout_secs)
    }

    /// Engine policy assembled from the file sections.
    pub fn sync_policy(&self) -> SyncPolicy {
        let scan = ScanPolicy {
            max_window: self.scan.max_window.max(1),
            max_consecutive_empty: self.scan.max_consecutive_empty,
            max_iterations: self.scan.max_iterations,
            rate_limit_retries: self.scan.rate_limit_retries,
            rate_limit_backoff: Duration::from_millis(self.scan.rate_limit_backoff_ms),
            call_timeout: Duration::from_secs(self.scan.call_timeout_secs),
            widen_after: self.scan.widen_after,
        };
        SyncPolicy {
            reconcile: ReconcilePolicy {
                max_deficit: self.reconcile.max_deficit,
                retry: scan.retry_policy(),
            },
            scan,
            details: DetailFetchPolicy {
                batch_size: self.metadata.batch_size.max(1),
                batch_pause: Duration::from_millis(self.metadata.batch_pause_ms),
                retry_rounds: self.metadata.retry_rounds,
                retry_delay: Duration::from_millis(self.metadata.retry_delay_ms),
            },
            max_incremental_gap: self.cache.max_incremental_gap,
            genesis_block: self.cache.genesis_block,
        }
    }
}
