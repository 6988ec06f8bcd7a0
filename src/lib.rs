//! collection-sync - wallet-scoped trading card collection sync
//!
//! Rebuilds the set of cards an account holds from the card contract's
//! append-only `Transfer` history:
//!
//! - **Scanner**: pages `eth_getLogs` backward under the provider's range limit
//! - **Reducer**: received minus sent
//! - **Reconciler**: point ownership checks when the set falls short of `balanceOf`
//! - **Checkpoints**: per-account SQLite cache so later runs scan only new blocks
//! - **Details**: card metadata with mirror gateways and a built-in player catalog
//! - **Packs**: pending pack records from the pack manager

pub mod config;
pub mod ledger;
pub mod metadata;
pub mod packs;
pub mod storage;
pub mod sync;
pub mod types;

pub use config::Config;
pub use ledger::{InMemoryLedger, JsonRpcLedger, LedgerClient, LedgerError};
pub use storage::{CheckpointStore, MemoryCheckpointStore, ScanCheckpoint, SqliteCheckpointStore};
pub use sync::{SyncEngine, SyncError, SyncReport};
pub use types::{HoldingSet, ItemDetail, ItemId, Subject};
