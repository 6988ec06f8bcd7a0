//! Collection synchronization
//!
//! Rebuilds a subject's holdings from the transfer log:
//! - [`scanner`] pages the log backward under the provider's range limit
//! - [`reducer`] folds events into a holding set
//! - [`reconcile`] checks the set against the authoritative balance
//! - [`engine`] drives one run per subject and persists the checkpoint

pub mod engine;
pub mod reconcile;
pub mod reducer;
pub mod retry;
pub mod scanner;

use thiserror::Error;

use crate::ledger::LedgerError;
use crate::storage::StorageError;

pub use engine::{ScanMode, SyncEngine, SyncPhase, SyncPolicy, SyncReport};
pub use reconcile::{Discrepancy, ReconcilePolicy, Reconciler, Reconciliation};
pub use reducer::{apply_delta, candidate_pool, reduce};
pub use retry::RetryPolicy;
pub use scanner::{LogScanner, ScanCursor, ScanOutcome, ScanPolicy, ScanRequest, ScanTermination};

/// Errors that abort a synchronization run. The cache is left untouched.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("ledger {stage} query failed: {source}")]
    Ledger {
        stage: &'static str,
        #[source]
        source: LedgerError,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("sync cancelled")]
    Cancelled,
}
