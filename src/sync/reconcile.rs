//! Cardinality reconciliation against the authoritative balance
//!
//! A derived set a few items short of the balance is usually a pagination
//! gap. Those are closed with point ownership checks on ids seen in the log
//! but excluded by the reducer. Anything else is reported, never repaired.

use serde::Serialize;
use tracing::{debug, info, warn};

use super::retry::RetryPolicy;
use crate::ledger::{LedgerClient, LedgerError};
use crate::types::{HoldingSet, ItemId, Subject};

#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    /// Largest deficit worth point-checking
    pub max_deficit: u64,
    /// Backoff for throttled or slow ownership checks
    pub retry: RetryPolicy,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            max_deficit: 20,
            retry: RetryPolicy::default(),
        }
    }
}

/// Soft warning attached to a reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Discrepancy {
    /// More items derived than the balance allows
    Surplus { derived: u64, authoritative: u64 },
    /// Too far short to repair with point checks
    LargeDeficit { deficit: u64, max_deficit: u64 },
    /// Point checks ran out of candidates before closing the gap
    Unresolved { remaining: u64 },
}

#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub holdings: HoldingSet,
    /// Ids added by point checks
    pub recovered: Vec<ItemId>,
    pub discrepancy: Option<Discrepancy>,
    pub point_checks: u32,
}

pub struct Reconciler<'a, L: LedgerClient> {
    ledger: &'a L,
    policy: &'a ReconcilePolicy,
}

impl<'a, L: LedgerClient> Reconciler<'a, L> {
    pub fn new(ledger: &'a L, policy: &'a ReconcilePolicy) -> Self {
        Self { ledger, policy }
    }

    /// Best-effort correction of `derived` toward `authoritative` items.
    pub async fn reconcile(
        &self,
        subject: Subject,
        derived: HoldingSet,
        authoritative: u64,
        candidates: &HoldingSet,
    ) -> Reconciliation {
        let derived_count = derived.len() as u64;
        let mut result = Reconciliation {
            holdings: derived,
            recovered: Vec::new(),
            discrepancy: None,
            point_checks: 0,
        };

        if derived_count == authoritative {
            return result;
        }

        if derived_count > authoritative {
            warn!(%subject, derived = derived_count, authoritative, "Derived holdings exceed balance");
            result.discrepancy = Some(Discrepancy::Surplus {
                derived: derived_count,
                authoritative,
            });
            return result;
        }

        let deficit = authoritative - derived_count;
        if deficit > self.policy.max_deficit {
            warn!(
                %subject,
                deficit,
                max_deficit = self.policy.max_deficit,
                "Holdings deficit too large to reconcile"
            );
            result.discrepancy = Some(Discrepancy::LargeDeficit {
                deficit,
                max_deficit: self.policy.max_deficit,
            });
            return result;
        }

        info!(%subject, deficit, candidates = candidates.len(), "Reconciling holdings with point checks");

        let unchecked: Vec<ItemId> = candidates.difference(&result.holdings).copied().collect();
        let mut remaining = deficit;
        for item in unchecked {
            if remaining == 0 {
                break;
            }
            result.point_checks += 1;
            let owner = self
                .policy
                .retry
                .run("owner_of", LedgerError::is_transient, || self.ledger.owner_of(item))
                .await;
            match owner {
                Ok(owner) if owner == subject => {
                    debug!(%item, "Recovered item by point check");
                    result.holdings.insert(item);
                    result.recovered.push(item);
                    remaining -= 1;
                }
                Ok(_) | Err(LedgerError::NonexistentItem(_)) => {}
                Err(e) => {
                    warn!(%item, error = %e, "Ownership check failed, treating as not held");
                }
            }
        }

        if remaining > 0 {
            warn!(%subject, remaining, "Point checks did not close the deficit");
            result.discrepancy = Some(Discrepancy::Unresolved { remaining });
        }
        result
    }
}
