//! Config loading and defaults integration tests

use std::path::PathBuf;
use std::time::Duration;

use alloy_primitives::Address;
use tempfile::TempDir;

use collection_sync::config::{Config, ConfigError};

#[test]
fn test_empty_file_uses_defaults() {
    let config = Config::from_toml("").expect("empty TOML is valid");

    assert_eq!(config.scan.max_window, 9000);
    assert_eq!(config.scan.max_consecutive_empty, 5);
    assert_eq!(config.scan.max_iterations, 500);
    assert_eq!(config.scan.rate_limit_retries, 3);
    assert_eq!(config.scan.rate_limit_backoff_ms, 500);
    assert_eq!(config.scan.call_timeout_secs, 15);
    assert_eq!(config.scan.widen_after, 8);
    assert_eq!(config.reconcile.max_deficit, 20);
    assert_eq!(config.cache.max_incremental_gap, 50_000);
    assert_eq!(config.cache.genesis_block, 0);
    assert_eq!(config.metadata.batch_size, 10);
    assert_eq!(config.metadata.batch_pause_ms, 250);
    assert_eq!(config.metadata.retry_rounds, 3);
    assert_eq!(config.metadata.retry_delay_ms, 2000);
    assert_eq!(config.metadata.fetch_timeout_secs, 10);
    assert_eq!(
        config.metadata.gateways,
        vec![
            "https://ipfs.io".to_string(),
            "https://cloudflare-ipfs.com".to_string(),
            "https://gateway.pinata.cloud".to_string(),
        ]
    );
}

#[test]
fn test_config_with_all_fields() {
    let toml_str = r#"
[ledger]
rpc_url = "https://sepolia.example/rpc"
card_contract = "0x1111111111111111111111111111111111111111"
pack_contract = "0x2222222222222222222222222222222222222222"
request_timeout_secs = 20

[scan]
max_window = 2000
max_consecutive_empty = 8
max_iterations = 100
rate_limit_retries = 5
rate_limit_backoff_ms = 250
call_timeout_secs = 7
widen_after = 2

[reconcile]
max_deficit = 4

[cache]
data_dir = "/var/lib/collection-sync"
max_incremental_gap = 1000
genesis_block = 5000000

[metadata]
gateways = ["https://mirror.example"]
fetch_timeout_secs = 3
batch_size = 4
batch_pause_ms = 0
retry_rounds = 1
retry_delay_ms = 100
"#;

    let config = Config::from_toml(toml_str).unwrap();
    let (rpc_url, card_contract) = config.ledger_endpoint().unwrap();
    assert_eq!(rpc_url, "https://sepolia.example/rpc");
    assert_eq!(card_contract, Address::repeat_byte(0x11));
    assert_eq!(config.ledger.pack_contract, Some(Address::repeat_byte(0x22)));
    assert_eq!(config.request_timeout(), Duration::from_secs(20));
    assert_eq!(config.cache.data_dir, PathBuf::from("/var/lib/collection-sync"));

    let policy = config.sync_policy();
    assert_eq!(policy.scan.max_window, 2000);
    assert_eq!(policy.scan.max_consecutive_empty, 8);
    assert_eq!(policy.scan.max_iterations, 100);
    assert_eq!(policy.scan.rate_limit_retries, 5);
    assert_eq!(policy.scan.rate_limit_backoff, Duration::from_millis(250));
    assert_eq!(policy.scan.call_timeout, Duration::from_secs(7));
    assert_eq!(policy.reconcile.max_deficit, 4);
    assert_eq!(policy.scan.widen_after, 2);
    assert_eq!(policy.reconcile.retry.call_timeout, Duration::from_secs(7));
    assert_eq!(policy.reconcile.retry.retries, 5);
    assert_eq!(policy.reconcile.retry.base_delay, Duration::from_millis(250));
    assert_eq!(policy.details.batch_size, 4);
    assert_eq!(policy.details.batch_pause, Duration::ZERO);
    assert_eq!(policy.details.retry_rounds, 1);
    assert_eq!(policy.max_incremental_gap, 1000);
    assert_eq!(policy.genesis_block, 5_000_000);
}

#[test]
fn test_partial_section_keeps_other_defaults() {
    let config = Config::from_toml("[scan]\nmax_window = 500\n").unwrap();
    assert_eq!(config.scan.max_window, 500);
    assert_eq!(config.scan.max_iterations, 500);
    assert_eq!(config.reconcile.max_deficit, 20);
}

#[test]
fn test_zero_window_is_clamped() {
    let config = Config::from_toml("[scan]\nmax_window = 0\n[metadata]\nbatch_size = 0\n").unwrap();
    let policy = config.sync_policy();
    assert_eq!(policy.scan.max_window, 1);
    assert_eq!(policy.details.batch_size, 1);
}

#[test]
fn test_missing_ledger_endpoint() {
    let config = Config::default();
    assert!(matches!(
        config.ledger_endpoint(),
        Err(ConfigError::Missing("ledger.rpc_url"))
    ));

    let config = Config::from_toml("[ledger]\nrpc_url = \"http://localhost:8545\"\n").unwrap();
    assert!(matches!(
        config.ledger_endpoint(),
        Err(ConfigError::Missing("ledger.card_contract"))
    ));
}

#[test]
fn test_invalid_toml_is_error() {
    assert!(matches!(
        Config::from_toml("[scan\nmax_window = 1"),
        Err(ConfigError::Parse(_))
    ));
    assert!(matches!(
        Config::from_toml("[ledger]\ncard_contract = \"not-an-address\"\n"),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let config = Config::load(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.scan.max_window, 9000);
}

#[test]
fn test_load_from_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("collection-sync.toml");
    std::fs::write(&path, "[reconcile]\nmax_deficit = 7\n").unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.reconcile.max_deficit, 7);
}
