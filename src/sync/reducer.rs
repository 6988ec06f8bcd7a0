//! Folding transfer events into a holding set
//!
//! Pure set arithmetic. Event order and duplicates do not matter.

use crate::types::{HoldingSet, TransferEvent};

/// Ids received minus ids sent.
pub fn reduce(incoming: &[TransferEvent], outgoing: &[TransferEvent]) -> HoldingSet {
    apply_delta(&HoldingSet::new(), incoming, outgoing)
}

/// `(prior ∪ incoming) − outgoing`, for folding an incremental scan into a
/// checkpointed set.
pub fn apply_delta(prior: &HoldingSet, incoming: &[TransferEvent], outgoing: &[TransferEvent]) -> HoldingSet {
    let mut held = prior.clone();
    held.extend(incoming.iter().map(|e| e.item_id));
    for event in outgoing {
        held.remove(&event.item_id);
    }
    held
}

/// Every id that appeared in either projection.
pub fn candidate_pool(incoming: &[TransferEvent], outgoing: &[TransferEvent]) -> HoldingSet {
    incoming
        .iter()
        .chain(outgoing.iter())
        .map(|e| e.item_id)
        .collect()
}
