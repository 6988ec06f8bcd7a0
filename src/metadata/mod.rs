//! Item detail fetch
//!
//! Resolves held item ids to card details. Details are immutable, so only
//! ids without a cached detail are ever fetched. A missing detail is never
//! fatal: the item stays held and is retried on the next run.

pub mod catalog;
pub mod gateway;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ledger::{LedgerClient, LedgerError};
use crate::types::{ItemDetail, ItemId, Rarity};

pub use catalog::{PlayerCatalog, PlayerProfile};
pub use gateway::{CardDocument, GatewayFetcher};

#[derive(Debug, Error)]
pub enum DetailError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("gateway error: {0}")]
    Gateway(String),

    #[error("unsupported metadata uri: {0}")]
    UnsupportedUri(String),

    #[error("no gateways configured")]
    NoGateways,

    #[error("fetch timed out: {0}")]
    Timeout(String),

    #[error("invalid rarity value {0}")]
    InvalidRarity(u8),
}

impl DetailError {
    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            DetailError::Ledger(LedgerError::NonexistentItem(_))
                | DetailError::InvalidRarity(_)
                | DetailError::UnsupportedUri(_)
        )
    }
}

/// Resolves an item id to its descriptive fields.
#[async_trait::async_trait]
pub trait DetailSource: Send + Sync {
    async fn fetch_detail(&self, item: ItemId) -> Result<ItemDetail, DetailError>;
}

/// Card details from on-chain metadata, enriched by the metadata document
/// when a gateway can serve it.
pub struct CardDetailSource<L: LedgerClient> {
    ledger: Arc<L>,
    catalog: PlayerCatalog,
    gateway: Option<GatewayFetcher>,
}

impl<L: LedgerClient> CardDetailSource<L> {
    pub fn new(ledger: Arc<L>, catalog: PlayerCatalog, gateway: Option<GatewayFetcher>) -> Self {
        Self {
            ledger,
            catalog,
            gateway,
        }
    }

    /// Catalog-only source that never touches the network beyond the ledger.
    pub fn offline(ledger: Arc<L>) -> Self {
        Self::new(ledger, PlayerCatalog::builtin(), None)
    }
}

#[async_trait::async_trait]
impl<L: LedgerClient> DetailSource for CardDetailSource<L> {
    async fn fetch_detail(&self, item: ItemId) -> Result<ItemDetail, DetailError> {
        let meta = self.ledger.card_metadata(item).await?;
        let rarity = Rarity::try_from(meta.rarity).map_err(|_| DetailError::InvalidRarity(meta.rarity))?;

        let player_id = meta.player_id.to_string();
        let profile = self.catalog.lookup(&player_id);
        let mut detail = ItemDetail {
            player_id,
            player_name: profile.name,
            position: profile.position,
            team: profile.team,
            rarity,
            image_url: String::new(),
            rating: profile.rating,
            mint_timestamp: meta.mint_timestamp,
            metadata_uri: meta.metadata_uri.clone(),
        };

        if let (Some(gateway), false) = (&self.gateway, meta.metadata_uri.is_empty()) {
            match gateway.fetch_json::<CardDocument>(&meta.metadata_uri).await {
                Ok(doc) => doc.apply_to(&mut detail, gateway),
                Err(e) => {
                    debug!(item = %item, error = %e, "Metadata document unavailable, using catalog");
                }
            }
        }

        Ok(detail)
    }
}

/// Batching and retry settings for detail fetch.
#[derive(Debug, Clone)]
pub struct DetailFetchPolicy {
    pub batch_size: usize,
    pub batch_pause: Duration,
    pub retry_rounds: u32,
    pub retry_delay: Duration,
}

impl Default for DetailFetchPolicy {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_pause: Duration::from_millis(250),
            retry_rounds: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// Fetches details in small concurrent batches.
pub struct DetailFetcher<D: DetailSource> {
    source: Arc<D>,
    policy: DetailFetchPolicy,
}

impl<D: DetailSource> DetailFetcher<D> {
    pub fn new(source: Arc<D>, policy: DetailFetchPolicy) -> Self {
        Self { source, policy }
    }

    /// Fetch details for `items`. Ids that still fail after every retry
    /// round are absent from the result.
    pub async fn fetch_many(&self, items: &[ItemId]) -> BTreeMap<ItemId, ItemDetail> {
        let mut found = BTreeMap::new();
        let mut pending: Vec<ItemId> = items.to_vec();
        let batch_size = self.policy.batch_size.max(1);

        for round in 0..=self.policy.retry_rounds {
            if pending.is_empty() {
                break;
            }
            if round > 0 {
                info!(round, missing = pending.len(), "Retrying detail fetch");
                tokio::time::sleep(self.policy.retry_delay).await;
            }

            let mut missing = Vec::new();
            for (index, batch) in pending.chunks(batch_size).enumerate() {
                if index > 0 && !self.policy.batch_pause.is_zero() {
                    tokio::time::sleep(self.policy.batch_pause).await;
                }

                let results = join_all(batch.iter().map(|id| self.source.fetch_detail(*id))).await;
                for (id, result) in batch.iter().zip(results) {
                    match result {
                        Ok(detail) => {
                            found.insert(*id, detail);
                        }
                        Err(e) if !e.is_retryable() => {
                            warn!(item = %id, error = %e, "Detail fetch failed permanently");
                        }
                        Err(e) => {
                            debug!(item = %id, error = %e, "Detail fetch failed");
                            missing.push(*id);
                        }
                    }
                }
            }
            pending = missing;
        }

        if !pending.is_empty() {
            warn!(missing = pending.len(), "Some item details could not be fetched");
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use alloy_primitives::{Address, U256};

    use crate::ledger::InMemoryLedger;
    use crate::types::CardMetadata;

    /// Fails each item a fixed number of times before succeeding.
    struct FlakySource {
        failures: Mutex<HashMap<ItemId, u32>>,
        calls: Mutex<Vec<ItemId>>,
    }

    impl FlakySource {
        fn new(failures: &[(u64, u32)]) -> Self {
            Self {
                failures: Mutex::new(
                    failures
                        .iter()
                        .map(|(id, n)| (ItemId::from(*id), *n))
                        .collect(),
                ),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl DetailSource for FlakySource {
        async fn fetch_detail(&self, item: ItemId) -> Result<ItemDetail, DetailError> {
            self.calls.lock().unwrap().push(item);
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&item) {
                if *left > 0 {
                    *left -= 1;
                    return Err(DetailError::Timeout(item.to_string()));
                }
            }
            Ok(ItemDetail {
                player_id: item.to_string(),
                player_name: format!("Player #{}", item),
                position: "Unknown".into(),
                team: "Unknown".into(),
                rarity: Rarity::Common,
                image_url: String::new(),
                rating: 70,
                mint_timestamp: 0,
                metadata_uri: String::new(),
            })
        }
    }

    fn fast_policy(retry_rounds: u32) -> DetailFetchPolicy {
        DetailFetchPolicy {
            batch_size: 2,
            batch_pause: Duration::ZERO,
            retry_rounds,
            retry_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_retry_rounds_recover_flaky_items() {
        let source = Arc::new(FlakySource::new(&[(2, 2)]));
        let fetcher = DetailFetcher::new(source.clone(), fast_policy(3));
        let ids: Vec<ItemId> = (1..=5u64).map(ItemId::from).collect();

        let details = fetcher.fetch_many(&ids).await;
        assert_eq!(details.len(), 5);
        // 5 first-pass calls plus two retries of item 2
        assert_eq!(source.calls.lock().unwrap().len(), 7);
    }

    #[tokio::test]
    async fn test_exhausted_retries_leave_item_out() {
        let source = Arc::new(FlakySource::new(&[(1, 10)]));
        let fetcher = DetailFetcher::new(source.clone(), fast_policy(1));

        let details = fetcher.fetch_many(&[ItemId::from(1u64), ItemId::from(2u64)]).await;
        assert_eq!(details.len(), 1);
        assert!(details.contains_key(&ItemId::from(2u64)));
    }

    #[tokio::test]
    async fn test_card_source_uses_catalog_and_chain_metadata() {
        let alice = Address::repeat_byte(0xa1);
        let ledger = Arc::new(InMemoryLedger::new(0));
        ledger.mint(alice, 11u64, 1);
        ledger.set_card_metadata(
            11u64,
            CardMetadata {
                player_id: U256::from(5u64),
                rarity: 4,
                mint_timestamp: 1_700_000_123,
                metadata_uri: String::new(),
            },
        );

        let source = CardDetailSource::offline(ledger);
        let detail = source.fetch_detail(ItemId::from(11u64)).await.unwrap();
        assert_eq!(detail.player_name, "Travis Kelce");
        assert_eq!(detail.rarity, Rarity::Legendary);
        assert_eq!(detail.mint_timestamp, 1_700_000_123);
    }

    #[tokio::test]
    async fn test_card_source_rejects_unknown_rarity() {
        let ledger = Arc::new(InMemoryLedger::new(0));
        ledger.set_card_metadata(
            3u64,
            CardMetadata {
                player_id: U256::from(1u64),
                rarity: 9,
                mint_timestamp: 0,
                metadata_uri: String::new(),
            },
        );
        let source = CardDetailSource::offline(ledger);
        let err = source.fetch_detail(ItemId::from(3u64)).await.unwrap_err();
        assert!(matches!(err, DetailError::InvalidRarity(9)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_nonexistent_item_not_retried() {
        let ledger = Arc::new(InMemoryLedger::new(0));
        let source = Arc::new(CardDetailSource::offline(ledger));
        let fetcher = DetailFetcher::new(source, fast_policy(3));
        let details = fetcher.fetch_many(&[ItemId::from(99u64)]).await;
        assert!(details.is_empty());
    }
}
