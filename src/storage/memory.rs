//! In-memory checkpoint store
//!
//! Keeps serialized blobs rather than structs so loads go through the same
//! schema checks as the SQLite store.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::warn;

use super::{subject_key, CheckpointStore, ScanCheckpoint, StorageError};
use crate::types::Subject;

#[derive(Default)]
pub struct MemoryCheckpointStore {
    blobs: RwLock<HashMap<String, String>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw blob as-is, bypassing validation.
    pub fn put_raw(&self, subject: &Subject, raw: impl Into<String>) -> Result<(), StorageError> {
        self.blobs
            .write()
            .map_err(|_| StorageError::Poisoned)?
            .insert(subject_key(subject), raw.into());
        Ok(())
    }

    pub fn raw(&self, subject: &Subject) -> Option<String> {
        self.blobs.read().ok()?.get(&subject_key(subject)).cloned()
    }

    pub fn contains(&self, subject: &Subject) -> bool {
        self.raw(subject).is_some()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, subject: &Subject) -> Option<ScanCheckpoint> {
        let raw = self.raw(subject)?;
        match ScanCheckpoint::decode(*subject, &raw) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                warn!(%subject, error = %e, "Discarding unreadable checkpoint");
                None
            }
        }
    }

    fn save(&self, checkpoint: &ScanCheckpoint) -> Result<(), StorageError> {
        let raw = checkpoint.encode()?;
        self.put_raw(&checkpoint.subject, raw)
    }

    fn invalidate(&self, subject: &Subject) -> Result<(), StorageError> {
        self.blobs
            .write()
            .map_err(|_| StorageError::Poisoned)?
            .remove(&subject_key(subject));
        Ok(())
    }
}
