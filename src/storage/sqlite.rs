//! SQLite-backed checkpoint store

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use super::{subject_key, CheckpointStore, ScanCheckpoint, StorageError};
use crate::types::Subject;

/// Checkpoints stored as JSON blobs in a single table.
pub struct SqliteCheckpointStore {
    db: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    /// Open or create `checkpoints.db` under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("checkpoints.db");
        let db = Connection::open(&db_path)?;

        // WAL so a reader never blocks the writer of another subject
        db.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(&db)?;

        info!(path = %db_path.display(), "Checkpoint store initialized");
        Ok(Self { db: Mutex::new(db) })
    }

    /// Store backed by a private in-memory database.
    pub fn in_memory() -> Result<Self, StorageError> {
        let db = Connection::open_in_memory()?;
        Self::init(&db)?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn init(db: &Connection) -> Result<(), StorageError> {
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                subject TEXT PRIMARY KEY,
                blob TEXT NOT NULL,
                updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            );",
        )?;
        Ok(())
    }

    fn raw_blob(&self, subject: &Subject) -> Result<Option<String>, StorageError> {
        let db = self.db.lock().map_err(|_| StorageError::Poisoned)?;
        let mut stmt = db.prepare_cached("SELECT blob FROM checkpoints WHERE subject = ?1")?;
        let blob = stmt
            .query_row([subject_key(subject)], |row| row.get::<_, String>(0))
            .optional()?;
        Ok(blob)
    }

    /// Write a raw blob without validation.
    pub fn put_raw(&self, subject: &Subject, raw: &str) -> Result<(), StorageError> {
        let db = self.db.lock().map_err(|_| StorageError::Poisoned)?;
        db.execute(
            "INSERT INTO checkpoints (subject, blob, updated_at)
             VALUES (?1, ?2, strftime('%s', 'now'))
             ON CONFLICT(subject) DO UPDATE SET blob = ?2, updated_at = strftime('%s', 'now')",
            params![subject_key(subject), raw],
        )?;
        Ok(())
    }

    /// Number of stored checkpoints.
    pub fn len(&self) -> Result<usize, StorageError> {
        let db = self.db.lock().map_err(|_| StorageError::Poisoned)?;
        let count: i64 = db.query_row("SELECT count(*) FROM checkpoints", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn load(&self, subject: &Subject) -> Option<ScanCheckpoint> {
        let raw = match self.raw_blob(subject) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(%subject, error = %e, "Checkpoint read failed, treating as miss");
                return None;
            }
        };

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
        self.put_raw(&checkpoint.subject, &raw)?;
        debug!(
            subject = %checkpoint.subject,
            holdings = checkpoint.holdings.len(),
            position = checkpoint.last_scanned_position,
            "Saved checkpoint"
        );
        Ok(())
    }

    fn invalidate(&self, subject: &Subject) -> Result<(), StorageError> {
        let db = self.db.lock().map_err(|_| StorageError::Poisoned)?;
        db.execute(
            "DELETE FROM checkpoints WHERE subject = ?1",
            [subject_key(subject)],
        )?;
        debug!(%subject, "Invalidated checkpoint");
        Ok(())
    }
}
