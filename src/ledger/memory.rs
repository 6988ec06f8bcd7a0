//! Synthetic in-memory ledger
//!
//! Deterministic [`LedgerClient`] used by tests and dry runs. Ownership is
//! derived from the transfers applied to it, so `balance_of` is always the
//! ground truth for whatever history was recorded. Provider misbehaviour
//! (range limits, throttling, failing ranges) can be injected.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use alloy_primitives::{Address, BlockNumber, U256};

use super::{LedgerClient, LedgerError};
use crate::packs::PendingPack;
use crate::types::{CardMetadata, ItemId, Subject, TransferDirection, TransferEvent};

/// One recorded `transfer_logs` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueriedWindow {
    pub direction: TransferDirection,
    pub from: BlockNumber,
    pub to: BlockNumber,
}

#[derive(Default)]
struct LedgerState {
    tip: BlockNumber,
    transfers: Vec<TransferEvent>,
    owners: HashMap<ItemId, Address>,
    max_range: Option<u64>,
    rate_limited_calls: u32,
    rate_limited_owner_calls: u32,
    failing_ranges: Vec<(BlockNumber, BlockNumber)>,
    queried_windows: Vec<QueriedWindow>,
    owner_queries: Vec<ItemId>,
    metadata: HashMap<ItemId, CardMetadata>,
    pending_requests: HashMap<Address, Vec<U256>>,
    packs: HashMap<U256, PendingPack>,
}

/// Ledger held entirely in memory.
pub struct InMemoryLedger {
    state: RwLock<LedgerState>,
}

impl InMemoryLedger {
    pub fn new(tip: BlockNumber) -> Self {
        Self {
            state: RwLock::new(LedgerState {
                tip,
                ..Default::default()
            }),
        }
    }

    /// Reject log queries spanning more than `blocks` blocks.
    pub fn with_max_range(self, blocks: u64) -> Self {
        self.write().max_range = Some(blocks.max(1));
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, LedgerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LedgerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mint `item` to `to` at `block`.
    pub fn mint(&self, to: Address, item: impl Into<ItemId>, block: BlockNumber) {
        self.transfer(Address::ZERO, to, item, block);
    }

    /// Record a transfer and move ownership. Sending to the zero address burns.
    pub fn transfer(&self, from: Address, to: Address, item: impl Into<ItemId>, block: BlockNumber) {
        let item_id = item.into();
        let mut state = self.write();
        state.transfers.push(TransferEvent {
            from,
            to,
            item_id,
            block,
        });
        if to == Address::ZERO {
            state.owners.remove(&item_id);
        } else {
            state.owners.insert(item_id, to);
        }
        if block > state.tip {
            state.tip = block;
        }
    }

    pub fn set_tip(&self, tip: BlockNumber) {
        self.write().tip = tip;
    }

    /// Change the holder without a log entry, as if the transfer happened
    /// outside recorded history.
    pub fn set_owner(&self, item: impl Into<ItemId>, owner: Address) {
        self.write().owners.insert(item.into(), owner);
    }

    /// Throttle the next `calls` log queries.
    pub fn rate_limit_next(&self, calls: u32) {
        self.write().rate_limited_calls = calls;
    }

    /// Fail every log query overlapping `[from, to]` with a transport error.
    pub fn fail_range(&self, from: BlockNumber, to: BlockNumber) {
        self.write().failing_ranges.push((from, to));
    }

    /// Let every block range answer again.
    pub fn clear_failures(&self) {
        self.write().failing_ranges.clear();
    }

    /// Answer the next `calls` ownership checks with a rate-limit error.
    pub fn rate_limit_owner_next(&self, calls: u32) {
        self.write().rate_limited_owner_calls = calls;
    }

    pub fn set_card_metadata(&self, item: impl Into<ItemId>, metadata: CardMetadata) {
        self.write().metadata.insert(item.into(), metadata);
    }

    /// Register a pack and list it under its buyer.
    pub fn add_pending_pack(&self, pack: PendingPack) {
        let mut state = self.write();
        state
            .pending_requests
            .entry(pack.buyer)
            .or_default()
            .push(pack.request_id);
        state.packs.insert(pack.request_id, pack);
    }

    /// List a request id for a buyer without a pack record behind it.
    pub fn list_pending_request(&self, buyer: Address, request_id: U256) {
        self.write()
            .pending_requests
            .entry(buyer)
            .or_default()
            .push(request_id);
    }

    pub fn queried_windows(&self) -> Vec<QueriedWindow> {
        self.read().queried_windows.clone()
    }

    pub fn owner_queries(&self) -> Vec<ItemId> {
        self.read().owner_queries.clone()
    }

    pub fn transfer_count(&self) -> usize {
        self.read().transfers.len()
    }
}

#[async_trait::async_trait]
impl LedgerClient for InMemoryLedger {
    async fn tip(&self) -> Result<BlockNumber, LedgerError> {
        Ok(self.read().tip)
    }

    async fn transfer_logs(
        &self,
        direction: TransferDirection,
        subject: Subject,
        from: BlockNumber,
        to: BlockNumber,
    ) -> Result<Vec<TransferEvent>, LedgerError> {
        let mut state = self.write();
        state.queried_windows.push(QueriedWindow { direction, from, to });

        if state.rate_limited_calls > 0 {
            state.rate_limited_calls -= 1;
            return Err(LedgerError::RateLimited("synthetic throttle".into()));
        }

        if let Some(max) = state.max_range {
            let span = to.saturating_sub(from) + 1;
            if span > max {
                return Err(LedgerError::RangeTooWide(format!(
                    "range of {} blocks exceeds limit of {}",
                    span, max
                )));
            }
        }

        if state
            .failing_ranges
            .iter()
            .any(|(lo, hi)| from <= *hi && to >= *lo)
        {
            return Err(LedgerError::Transport("synthetic failure".into()));
        }

        Ok(state
            .transfers
            .iter()
            .filter(|e| e.block >= from && e.block <= to)
            .filter(|e| match direction {
                TransferDirection::Incoming => e.to == subject,
                TransferDirection::Outgoing => e.from == subject,
            })
            .cloned()
            .collect())
    }

    async fn balance_of(&self, subject: Subject) -> Result<u64, LedgerError> {
        Ok(self.read().owners.values().filter(|o| **o == subject).count() as u64)
    }

    async fn owner_of(&self, item: ItemId) -> Result<Address, LedgerError> {
        let mut state = self.write();
        state.owner_queries.push(item);
        if state.rate_limited_owner_calls > 0 {
            state.rate_limited_owner_calls -= 1;
            return Err(LedgerError::RateLimited("synthetic throttle".into()));
        }
        state
            .owners
            .get(&item)
            .copied()
            .ok_or(LedgerError::NonexistentItem(item))
    }

    async fn card_metadata(&self, item: ItemId) -> Result<CardMetadata, LedgerError> {
        let state = self.read();
        if let Some(meta) = state.metadata.get(&item) {
            return Ok(meta.clone());
        }
        if state.owners.contains_key(&item) {
            return Ok(CardMetadata {
                player_id: item.as_u256(),
                rarity: 0,
                mint_timestamp: 0,
                metadata_uri: String::new(),
            });
        }
        Err(LedgerError::NonexistentItem(item))
    }

    async fn user_pending_packs(&self, subject: Subject) -> Result<Vec<U256>, LedgerError> {
        Ok(self
            .read()
            .pending_requests
            .get(&subject)
            .cloned()
            .unwrap_or_default())
    }

    async fn pending_pack(&self, request_id: U256) -> Result<PendingPack, LedgerError> {
        self.read()
            .packs
            .get(&request_id)
            .cloned()
            .ok_or_else(|| LedgerError::Rpc {
                code: 3,
                message: format!("execution reverted: unknown request {}", request_id),
            })
    }
}
