//! Storage layer - durable scan checkpoints
//!
//! Handles:
//! - The versioned JSON cache blob written after each successful run
//! - SQLite persistence keyed by subject
//! - An in-memory store with the same serialization path
//!
//! A blob that fails to parse or carries another schema version is a cache
//! miss, never an error.

pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;

use alloy_primitives::BlockNumber;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{HoldingSet, ItemDetail, ItemId, Subject};

pub use memory::MemoryCheckpointStore;
pub use sqlite::SqliteCheckpointStore;

/// Bump when the blob layout changes; older blobs are then ignored.
pub const CACHE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("schema version {found} does not match {expected}")]
    SchemaMismatch { found: u32, expected: u32 },

    #[error("invalid scan position: {0}")]
    InvalidPosition(String),

    #[error("store lock poisoned")]
    Poisoned,
}

/// One held item as it appears in the cache blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedHolding {
    pub item_id: ItemId,
    #[serde(flatten)]
    pub detail: Option<ItemDetail>,
}

/// On-disk form of a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheBlob {
    pub version: u32,
    pub holdings: Vec<CachedHolding>,
    /// Decimal string so wide block numbers survive any JSON reader
    pub last_scanned_position: String,
    pub timestamp: u64,
}

/// Last known holdings for a subject and how far the log was scanned.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanCheckpoint {
    pub subject: Subject,
    pub last_scanned_position: BlockNumber,
    /// Held items with their detail, if it has been fetched
    pub holdings: BTreeMap<ItemId, Option<ItemDetail>>,
    pub saved_at: u64,
}

impl ScanCheckpoint {
    pub fn holding_set(&self) -> HoldingSet {
        self.holdings.keys().copied().collect()
    }

    /// Details already known, regardless of whether the item is still held.
    pub fn known_details(&self) -> BTreeMap<ItemId, ItemDetail> {
        self.holdings
            .iter()
            .filter_map(|(id, detail)| detail.clone().map(|d| (*id, d)))
            .collect()
    }

    pub fn to_blob(&self) -> CacheBlob {
        CacheBlob {
            version: CACHE_SCHEMA_VERSION,
            holdings: self
                .holdings
                .iter()
                .map(|(id, detail)| CachedHolding {
                    item_id: *id,
                    detail: detail.clone(),
                })
                .collect(),
            last_scanned_position: self.last_scanned_position.to_string(),
            timestamp: self.saved_at,
        }
    }

    pub fn from_blob(subject: Subject, blob: CacheBlob) -> Result<Self, StorageError> {
        if blob.version != CACHE_SCHEMA_VERSION {
            return Err(StorageError::SchemaMismatch {
                found: blob.version,
                expected: CACHE_SCHEMA_VERSION,
            });
        }
        let last_scanned_position = blob
            .last_scanned_position
            .parse::<BlockNumber>()
            .map_err(|_| StorageError::InvalidPosition(blob.last_scanned_position.clone()))?;

        Ok(Self {
            subject,
            last_scanned_position,
            holdings: blob
                .holdings
                .into_iter()
                .map(|h| (h.item_id, h.detail))
                .collect(),
            saved_at: blob.timestamp,
        })
    }

    pub fn encode(&self) -> Result<String, StorageError> {
        Ok(serde_json::to_string(&self.to_blob())?)
    }

    pub fn decode(subject: Subject, raw: &str) -> Result<Self, StorageError> {
        let blob: CacheBlob = serde_json::from_str(raw)?;
        Self::from_blob(subject, blob)
    }
}

/// Storage key for a subject. Addresses are case-insensitive.
pub fn subject_key(subject: &Subject) -> String {
    subject.to_string().to_lowercase()
}

/// Durable key-value store of checkpoints, one per subject.
pub trait CheckpointStore: Send + Sync {
    /// Checkpoint for the subject, or `None` on miss, corruption or schema
    /// mismatch.
    fn load(&self, subject: &Subject) -> Option<ScanCheckpoint>;

    /// Overwrite the subject's checkpoint.
    fn save(&self, checkpoint: &ScanCheckpoint) -> Result<(), StorageError>;

    /// Drop the subject's checkpoint.
    fn invalidate(&self, subject: &Subject) -> Result<(), StorageError>;
}
