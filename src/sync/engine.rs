//! Synchronization run driver
//!
//! One run per subject at a time:
//!
//! ```text
//! Idle -> CacheCheck -> FullScan | IncrementalScan -> Reduce -> Reconcile
//!      -> DetailFetch -> Persist -> Idle
//! ```
//!
//! Any unrecoverable failure passes through `Error` back to `Idle` without
//! touching the stored checkpoint. The checkpoint is written once, at the
//! end of a run that completed its scan. A run that skipped windows stores
//! its position at the lowest skipped block, so the next run covers them again.

use std::collections::BTreeMap;
use std::sync::Arc;

use alloy_primitives::BlockNumber;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn, Instrument};

use super::reconcile::{Discrepancy, ReconcilePolicy, Reconciler};
use super::reducer::{apply_delta, candidate_pool, reduce};
use super::retry::RetryPolicy;
use super::scanner::{LogScanner, ScanPolicy, ScanRequest, ScanTermination};
use super::SyncError;
use crate::ledger::{LedgerClient, LedgerError};
use crate::metadata::{DetailFetchPolicy, DetailFetcher, DetailSource};
use crate::storage::{CheckpointStore, ScanCheckpoint};
use crate::types::{unix_now, ItemDetail, ItemId, Subject};

/// Where a subject's run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    CacheCheck,
    FullScan,
    IncrementalScan,
    Reduce,
    Reconcile,
    DetailFetch,
    Persist,
    Error,
}

/// How the log was scanned for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// From the configured genesis block to the tip
    Full,
    /// From the checkpoint position to the tip
    Incremental,
    /// Balance was zero, nothing to scan
    Skipped,
}

/// Tunables for a run.
#[derive(Debug, Clone)]
pub struct SyncPolicy {
    pub scan: ScanPolicy,
    pub reconcile: ReconcilePolicy,
    pub details: DetailFetchPolicy,
    /// Largest checkpoint age, in blocks, still scanned incrementally
    pub max_incremental_gap: u64,
    /// First block a full scan visits
    pub genesis_block: BlockNumber,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            scan: ScanPolicy::default(),
            reconcile: ReconcilePolicy::default(),
            details: DetailFetchPolicy::default(),
            max_incremental_gap: 50_000,
            genesis_block: 0,
        }
    }
}

/// Result of one run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub run_id: String,
    pub subject: Subject,
    pub mode: ScanMode,
    pub tip: BlockNumber,
    pub balance: u64,
    /// Held items, with detail where one is known
    pub holdings: BTreeMap<ItemId, Option<ItemDetail>>,
    /// Held now but absent from the previous checkpoint
    pub new_items: Vec<ItemId>,
    /// Added by reconciliation point checks
    pub recovered: Vec<ItemId>,
    pub discrepancy: Option<Discrepancy>,
    pub termination: Option<ScanTermination>,
    pub skipped_windows: Vec<(BlockNumber, BlockNumber)>,
    pub persisted: bool,
    /// Position stored in the checkpoint, when one was written
    pub checkpoint_position: Option<BlockNumber>,
}

impl SyncReport {
    pub fn item_ids(&self) -> Vec<ItemId> {
        self.holdings.keys().copied().collect()
    }
}

/// Drives synchronization runs against a ledger, a checkpoint store and a
/// detail source.
pub struct SyncEngine<L, S, D>
where
    L: LedgerClient,
    S: CheckpointStore,
    D: DetailSource,
{
    ledger: Arc<L>,
    store: Arc<S>,
    details: DetailFetcher<D>,
    policy: SyncPolicy,
    /// Present only while a run for the subject is active or queued
    locks: DashMap<Subject, Arc<Mutex<()>>>,
    /// Subjects without an entry are idle
    phases: DashMap<Subject, SyncPhase>,
}

impl<L, S, D> SyncEngine<L, S, D>
where
    L: LedgerClient,
    S: CheckpointStore,
    D: DetailSource,
{
    pub fn new(ledger: Arc<L>, store: Arc<S>, details: Arc<D>, policy: SyncPolicy) -> Self {
        let details = DetailFetcher::new(details, policy.details.clone());
        Self {
            ledger,
            store,
            details,
            policy,
            locks: DashMap::new(),
            phases: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Subjects with a run in flight or waiting for one.
    pub fn active_subjects(&self) -> usize {
        self.locks.len()
    }

    /// Current phase of the subject's run.
    pub fn phase(&self, subject: &Subject) -> SyncPhase {
        self.phases
            .get(subject)
            .map(|p| *p)
            .unwrap_or(SyncPhase::Idle)
    }

    fn set_phase(&self, subject: Subject, phase: SyncPhase) {
        debug!(%subject, ?phase, "Sync phase");
        self.phases.insert(subject, phase);
    }

    fn subject_lock(&self, subject: Subject) -> Arc<Mutex<()>> {
        self.locks
            .entry(subject)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run a synchronization for `subject` to completion.
    pub async fn sync(&self, subject: Subject) -> Result<SyncReport, SyncError> {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.sync_with_cancel(subject, cancel_rx).await
    }

    /// Run a synchronization that stops between scan windows once `cancel`
    /// flips to `true`. A cancelled run persists nothing.
    pub async fn sync_with_cancel(
        &self,
        subject: Subject,
        cancel: watch::Receiver<bool>,
    ) -> Result<SyncReport, SyncError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("sync", run_id = %run_id, %subject);
        self.run_serialized(run_id, subject, cancel).instrument(span).await
    }

    async fn run_serialized(
        &self,
        run_id: String,
        subject: Subject,
        cancel: watch::Receiver<bool>,
    ) -> Result<SyncReport, SyncError> {
        let lock = self.subject_lock(subject);
        let guard = lock.lock().await;

        let result = self.run(run_id, subject, &cancel).await;
        if let Err(e) = &result {
            self.set_phase(subject, SyncPhase::Error);
            warn!(%subject, error = %e, "Sync run failed, checkpoint left untouched");
        }
        self.phases.remove(&subject);
        debug!(%subject, phase = ?SyncPhase::Idle, "Sync phase");

        drop(guard);
        drop(lock);
        // Waiting runs hold their own clone, so the entry stays until the last one
        self.locks
            .remove_if(&subject, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn ledger_call<T, F, Fut>(&self, stage: &'static str, op: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, LedgerError>>,
    {
        let retry: RetryPolicy = self.policy.scan.retry_policy();
        retry
            .run(stage, LedgerError::is_transient, op)
            .await
            .map_err(|source| SyncError::Ledger { stage, source })
    }

    async fn run(
        &self,
        run_id: String,
        subject: Subject,
        cancel: &watch::Receiver<bool>,
    ) -> Result<SyncReport, SyncError> {
        self.set_phase(subject, SyncPhase::CacheCheck);
        let prior = self.store.load(&subject);

        let tip = self.ledger_call("tip", || self.ledger.tip()).await?;
        let balance = self
            .ledger_call("balance", || self.ledger.balance_of(subject))
            .await?;

        info!(
            %subject,
            tip,
            balance,
            cached = prior.as_ref().map(|c| c.holdings.len()),
            "Starting sync"
        );

        if balance == 0 {
            if prior.is_some() {
                self.store.invalidate(&subject)?;
                info!(%subject, "Balance is zero, checkpoint invalidated");
            }
            return Ok(SyncReport {
                run_id,
                subject,
                mode: ScanMode::Skipped,
                tip,
                balance,
                holdings: BTreeMap::new(),
                new_items: Vec::new(),
                recovered: Vec::new(),
                discrepancy: None,
                termination: None,
                skipped_windows: Vec::new(),
                persisted: false,
                checkpoint_position: None,
            });
        }

        let (mode, from) = match &prior {
            Some(cp)
                if cp.last_scanned_position <= tip
                    && tip - cp.last_scanned_position <= self.policy.max_incremental_gap =>
            {
                (ScanMode::Incremental, cp.last_scanned_position)
            }
            Some(cp) => {
                info!(
                    %subject,
                    checkpoint = cp.last_scanned_position,
                    tip,
                    "Checkpoint too old for incremental scan, rescanning"
                );
                (ScanMode::Full, self.policy.genesis_block)
            }
            None => (ScanMode::Full, self.policy.genesis_block),
        };

        self.set_phase(
            subject,
            match mode {
                ScanMode::Incremental => SyncPhase::IncrementalScan,
                _ => SyncPhase::FullScan,
            },
        );
        let request = ScanRequest {
            subject,
            from,
            to: tip,
            stop_on_empty_run: mode == ScanMode::Full,
        };
        let outcome = LogScanner::new(self.ledger.as_ref(), &self.policy.scan)
            .scan(&request, cancel)
            .await;
        if outcome.termination == ScanTermination::Cancelled {
            return Err(SyncError::Cancelled);
        }

        self.set_phase(subject, SyncPhase::Reduce);
        let derived = match (&prior, mode) {
            (Some(cp), ScanMode::Incremental) => {
                apply_delta(&cp.holding_set(), &outcome.incoming, &outcome.outgoing)
            }
            _ => reduce(&outcome.incoming, &outcome.outgoing),
        };
        let mut candidates = candidate_pool(&outcome.incoming, &outcome.outgoing);
        if let Some(cp) = &prior {
            candidates.extend(cp.holdings.keys().copied());
        }

        self.set_phase(subject, SyncPhase::Reconcile);
        let reconciliation = Reconciler::new(self.ledger.as_ref(), &self.policy.reconcile)
            .reconcile(subject, derived, balance, &candidates)
            .await;

        self.set_phase(subject, SyncPhase::DetailFetch);
        let mut known = prior
            .as_ref()
            .map(ScanCheckpoint::known_details)
            .unwrap_or_default();
        let missing: Vec<ItemId> = reconciliation
            .holdings
            .iter()
            .filter(|id| !known.contains_key(*id))
            .copied()
            .collect();
        if !missing.is_empty() {
            info!(%subject, count = missing.len(), "Fetching item details");
            known.extend(self.details.fetch_many(&missing).await);
        }

        let holdings: BTreeMap<ItemId, Option<ItemDetail>> = reconciliation
            .holdings
            .iter()
            .map(|id| (*id, known.get(id).cloned()))
            .collect();
        let new_items: Vec<ItemId> = match &prior {
            Some(cp) => holdings
                .keys()
                .filter(|id| !cp.holdings.contains_key(*id))
                .copied()
                .collect(),
            None => Vec::new(),
        };

        let checkpoint_position = if outcome.termination == ScanTermination::IterationCap {
            warn!(%subject, "Scan incomplete, not persisting checkpoint");
            None
        } else {
            if *cancel.borrow() {
                return Err(SyncError::Cancelled);
            }
            let position = match outcome.skipped_windows.iter().map(|(start, _)| *start).min() {
                Some(lowest) => {
                    warn!(
                        %subject,
                        skipped = outcome.skipped_windows.len(),
                        position = lowest,
                        "Windows skipped, checkpoint held back for the next run"
                    );
                    lowest.min(tip)
                }
                None => tip,
            };
            self.set_phase(subject, SyncPhase::Persist);
            self.store.save(&ScanCheckpoint {
                subject,
                last_scanned_position: position,
                holdings: holdings.clone(),
                saved_at: unix_now(),
            })?;
            Some(position)
        };
        let persisted = checkpoint_position.is_some();

        info!(
            %subject,
            mode = ?mode,
            holdings = holdings.len(),
            new_items = new_items.len(),
            recovered = reconciliation.recovered.len(),
            persisted,
            "Sync complete"
        );

        Ok(SyncReport {
            run_id,
            subject,
            mode,
            tip,
            balance,
            holdings,
            new_items,
            recovered: reconciliation.recovered,
            discrepancy: reconciliation.discrepancy,
            termination: Some(outcome.termination),
            skipped_windows: outcome.skipped_windows,
            persisted,
            checkpoint_position,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use alloy_primitives::Address;

    use crate::ledger::InMemoryLedger;
    use crate::metadata::CardDetailSource;
    use crate::storage::MemoryCheckpointStore;

    type Engine = SyncEngine<InMemoryLedger, MemoryCheckpointStore, CardDetailSource<InMemoryLedger>>;

    fn fast_policy() -> SyncPolicy {
        let mut policy = SyncPolicy::default();
        policy.scan.max_window = 1000;
        policy.scan.rate_limit_backoff = Duration::from_millis(1);
        policy.details.batch_pause = Duration::ZERO;
        policy.details.retry_delay = Duration::from_millis(1);
        policy.reconcile.retry = policy.scan.retry_policy();
        policy
    }

    fn engine(ledger: Arc<InMemoryLedger>) -> Engine {
        let details = Arc::new(CardDetailSource::offline(ledger.clone()));
        SyncEngine::new(ledger, Arc::new(MemoryCheckpointStore::new()), details, fast_policy())
    }

    #[tokio::test]
    async fn test_first_run_is_full_and_persists() {
        let alice = Address::repeat_byte(0xa1);
        let ledger = Arc::new(InMemoryLedger::new(0));
        ledger.mint(alice, 1u64, 10);
        ledger.mint(alice, 2u64, 2_500);

        let engine = engine(ledger);
        let report = engine.sync(alice).await.unwrap();

        assert_eq!(report.mode, ScanMode::Full);
        assert_eq!(report.item_ids(), vec![ItemId::from(1u64), ItemId::from(2u64)]);
        assert!(report.new_items.is_empty());
        assert!(report.persisted);
        assert!(report.holdings.values().all(|d| d.is_some()));
        assert_eq!(engine.phase(&alice), SyncPhase::Idle);
        assert!(engine.store().contains(&alice));
        assert_eq!(report.checkpoint_position, Some(report.tip));
    }

    #[tokio::test]
    async fn test_finished_runs_leave_no_per_subject_state() {
        let ledger = Arc::new(InMemoryLedger::new(0));
        let subjects: Vec<Address> = (1..=20u8).map(Address::repeat_byte).collect();
        for (i, subject) in subjects.iter().enumerate() {
            ledger.mint(*subject, i as u64 + 1, 10 + i as u64);
        }

        let engine = engine(ledger);
        for subject in &subjects {
            engine.sync(*subject).await.unwrap();
        }
        assert_eq!(engine.active_subjects(), 0);
        assert!(engine.phases.is_empty());

        let runs = futures::future::join_all(subjects.iter().map(|s| engine.sync(*s))).await;
        assert!(runs.iter().all(|r| r.is_ok()));
        assert_eq!(engine.active_subjects(), 0);
        assert!(engine.phases.is_empty());
    }

    #[tokio::test]
    async fn test_tip_failure_leaves_cache_alone() {
        struct DownLedger;

        #[async_trait::async_trait]
        impl LedgerClient for DownLedger {
            async fn tip(&self) -> Result<BlockNumber, LedgerError> {
                Err(LedgerError::Transport("connection refused".into()))
            }
            async fn transfer_logs(
                &self,
                _: crate::types::TransferDirection,
                _: Subject,
                _: BlockNumber,
                _: BlockNumber,
            ) -> Result<Vec<crate::types::TransferEvent>, LedgerError> {
                unreachable!()
            }
            async fn balance_of(&self, _: Subject) -> Result<u64, LedgerError> {
                unreachable!()
            }
            async fn owner_of(&self, _: ItemId) -> Result<Address, LedgerError> {
                unreachable!()
            }
            async fn card_metadata(&self, _: ItemId) -> Result<crate::types::CardMetadata, LedgerError> {
                unreachable!()
            }
            async fn user_pending_packs(&self, _: Subject) -> Result<Vec<alloy_primitives::U256>, LedgerError> {
                unreachable!()
            }
            async fn pending_pack(
                &self,
                _: alloy_primitives::U256,
            ) -> Result<crate::packs::PendingPack, LedgerError> {
                unreachable!()
            }
        }

        let ledger = Arc::new(DownLedger);
        let store = Arc::new(MemoryCheckpointStore::new());
        let details = Arc::new(CardDetailSource::offline(ledger.clone()));
        let engine = SyncEngine::new(ledger, store.clone(), details, fast_policy());
        let alice = Address::repeat_byte(0xa1);
        store.put_raw(&alice, "sentinel").unwrap();

        let err = engine.sync(alice).await.unwrap_err();
        assert!(matches!(err, SyncError::Ledger { stage: "tip", .. }));
        assert_eq!(store.raw(&alice).as_deref(), Some("sentinel"));
        assert_eq!(engine.phase(&alice), SyncPhase::Idle);
        assert_eq!(engine.active_subjects(), 0);
    }
}
