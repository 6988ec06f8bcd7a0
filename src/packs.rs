//! Pending pack tracking
//!
//! A purchased pack waits for its randomness request to be fulfilled before it
//! can be opened. The pack manager keeps the list of open request ids per
//! buyer; this module turns that list into pack records.

use std::sync::Arc;

use alloy_primitives::{Address, U256};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ledger::{LedgerClient, LedgerError};
use crate::types::Subject;

/// A pack bought by a user, keyed by its randomness request id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPack {
    pub request_id: U256,
    pub pack_type: u8,
    pub buyer: Address,
    /// Filled in once randomness is fulfilled
    pub player_ids: Vec<U256>,
    pub rarities: Vec<u8>,
    pub fulfilled: bool,
}

impl PendingPack {
    /// Fulfilled packs can be opened to mint their cards.
    pub fn is_ready(&self) -> bool {
        self.fulfilled
    }
}

/// Reads the subject's unopened packs from the pack manager.
pub struct PendingPackTracker<L: LedgerClient> {
    ledger: Arc<L>,
}

impl<L: LedgerClient> PendingPackTracker<L> {
    pub fn new(ledger: Arc<L>) -> Self {
        Self { ledger }
    }

    /// All pending packs for the subject. Packs whose record cannot be read
    /// are logged and left out; only the id listing itself is fatal.
    pub async fn pending_packs(&self, subject: Subject) -> Result<Vec<PendingPack>, LedgerError> {
        let request_ids = self.ledger.user_pending_packs(subject).await?;
        debug!(%subject, count = request_ids.len(), "pending pack ids");

        if request_ids.is_empty() {
            return Ok(vec![]);
        }

        let results = join_all(request_ids.iter().map(|id| self.ledger.pending_pack(*id))).await;

        let mut packs = Vec::with_capacity(results.len());
        for (id, result) in request_ids.iter().zip(results) {
            match result {
                Ok(pack) => packs.push(pack),
                Err(e) => warn!(request_id = %id, error = %e, "Failed to read pending pack"),
            }
        }
        Ok(packs)
    }

    /// Pending packs whose randomness has arrived.
    pub async fn ready_to_open(&self, subject: Subject) -> Result<Vec<PendingPack>, LedgerError> {
        let packs = self.pending_packs(subject).await?;
        Ok(packs.into_iter().filter(PendingPack::is_ready).collect())
    }
}
