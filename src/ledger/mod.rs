//! Ledger collaborators
//!
//! Everything the sync engine knows about the chain goes through
//! [`LedgerClient`]:
//! - Transfer log queries, range-limited by the provider
//! - Authoritative balance and point ownership checks
//! - Card metadata and pending pack reads
//!
//! [`rpc::JsonRpcLedger`] talks to a JSON-RPC endpoint; [`memory::InMemoryLedger`]
//! is a synthetic ledger for tests and dry runs.

pub mod abi;
pub mod memory;
pub mod rpc;

use alloy_primitives::{Address, BlockNumber, U256};
use thiserror::Error;

use crate::packs::PendingPack;
use crate::types::{CardMetadata, ItemId, Subject, TransferDirection, TransferEvent};

pub use memory::InMemoryLedger;
pub use rpc::JsonRpcLedger;

/// Errors surfaced by ledger queries.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// Provider refused the block range as too wide
    #[error("block range too wide: {0}")]
    RangeTooWide(String),

    /// Provider is throttling us
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Call did not complete in time
    #[error("request timed out")]
    Timeout,

    /// Token was never minted or has been burned
    #[error("item {0} does not exist")]
    NonexistentItem(ItemId),

    /// Network or HTTP level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON-RPC error object we could not classify
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Response did not have the expected shape
    #[error("malformed response: {0}")]
    Decode(String),

    /// Operation needs configuration this client does not have
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl LedgerError {
    /// Errors worth retrying against the same bounds.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::RateLimited(_) | LedgerError::Timeout)
    }
}

/// Read-only view of the card and pack contracts.
#[async_trait::async_trait]
pub trait LedgerClient: Send + Sync {
    /// Latest block number.
    async fn tip(&self) -> Result<BlockNumber, LedgerError>;

    /// Transfer logs in `[from, to]` (inclusive) where the subject is the
    /// receiver (`Incoming`) or the sender (`Outgoing`).
    async fn transfer_logs(
        &self,
        direction: TransferDirection,
        subject: Subject,
        from: BlockNumber,
        to: BlockNumber,
    ) -> Result<Vec<TransferEvent>, LedgerError>;

    /// Number of cards the subject currently holds.
    async fn balance_of(&self, subject: Subject) -> Result<u64, LedgerError>;

    /// Current holder of an item. Fails with `NonexistentItem` for unminted or
    /// burned ids.
    async fn owner_of(&self, item: ItemId) -> Result<Address, LedgerError>;

    /// On-chain card metadata for an item.
    async fn card_metadata(&self, item: ItemId) -> Result<CardMetadata, LedgerError>;

    /// Request ids of packs bought by the subject and not yet opened.
    async fn user_pending_packs(&self, subject: Subject) -> Result<Vec<U256>, LedgerError>;

    /// Pack state for one randomness request.
    async fn pending_pack(&self, request_id: U256) -> Result<PendingPack, LedgerError>;
}
