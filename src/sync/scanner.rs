//! Range-paginated transfer log scanner
//!
//! Walks the log backward from `to` toward `from` in windows no wider than
//! `max_window`. A window the provider rejects as too wide is halved and
//! retried with the same upper bound; position only moves after a window
//! has been queried or skipped. After a run of successful windows a narrowed
//! window doubles again, up to `max_window`. Windows are sequential, but the
//! incoming and outgoing queries of one window run concurrently.

use std::time::Duration;

use alloy_primitives::BlockNumber;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::retry::RetryPolicy;
use crate::ledger::{LedgerClient, LedgerError};
use crate::types::{Subject, TransferDirection, TransferEvent};

/// Scanner limits.
#[derive(Debug, Clone)]
pub struct ScanPolicy {
    pub max_window: u64,
    pub max_consecutive_empty: u32,
    pub max_iterations: u32,
    pub rate_limit_retries: u32,
    pub rate_limit_backoff: Duration,
    pub call_timeout: Duration,
    /// Successful windows in a row before a narrowed window doubles; 0 never widens
    pub widen_after: u32,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            max_window: 9000,
            max_consecutive_empty: 5,
            max_iterations: 500,
            rate_limit_retries: 3,
            rate_limit_backoff: Duration::from_millis(500),
            call_timeout: Duration::from_secs(15),
            widen_after: 8,
        }
    }
}

impl ScanPolicy {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.rate_limit_retries,
            base_delay: self.rate_limit_backoff,
            call_timeout: self.call_timeout,
        }
    }
}

/// Bounds of one scan, both inclusive.
#[derive(Debug, Clone, Copy)]
pub struct ScanRequest {
    pub subject: Subject,
    pub from: BlockNumber,
    pub to: BlockNumber,
    /// Stop after a run of empty windows once something has been found
    pub stop_on_empty_run: bool,
}

/// Why a scan stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanTermination {
    /// Every window down to `from` was visited
    ReachedFloor,
    /// Stopped early after consecutive empty windows
    EmptyRun,
    /// Hit `max_iterations`
    IterationCap,
    /// Caller abandoned the run between windows
    Cancelled,
}

/// Everything accumulated by one scan.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub incoming: Vec<TransferEvent>,
    pub outgoing: Vec<TransferEvent>,
    pub termination: ScanTermination,
    pub windows_scanned: u32,
    /// Windows given up on and treated as empty
    pub skipped_windows: Vec<(BlockNumber, BlockNumber)>,
    pub narrowings: u32,
    pub widenings: u32,
}

impl ScanOutcome {
    fn new() -> Self {
        Self {
            incoming: Vec::new(),
            outgoing: Vec::new(),
            termination: ScanTermination::ReachedFloor,
            windows_scanned: 0,
            skipped_windows: Vec::new(),
            narrowings: 0,
            widenings: 0,
        }
    }

    pub fn reached_floor(&self) -> bool {
        self.termination == ScanTermination::ReachedFloor
    }

    pub fn event_count(&self) -> usize {
        self.incoming.len() + self.outgoing.len()
    }
}

/// Loop state of a backward scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanCursor {
    pub window_start: BlockNumber,
    pub window_end: BlockNumber,
    pub window_size: u64,
    pub consecutive_empty: u32,
    /// Windows answered in a row since the last narrowing or failure
    pub consecutive_ok: u32,
    pub iterations: u32,
}

impl ScanCursor {
    pub fn new(floor: BlockNumber, ceiling: BlockNumber, window_size: u64) -> Self {
        let mut cursor = Self {
            window_start: ceiling,
            window_end: ceiling,
            window_size: window_size.max(1),
            consecutive_empty: 0,
            consecutive_ok: 0,
            iterations: 0,
        };
        cursor.place(floor);
        cursor
    }

    fn place(&mut self, floor: BlockNumber) {
        self.window_start = self
            .window_end
            .saturating_sub(self.window_size - 1)
            .max(floor);
    }

    /// Halve the window, keeping `window_end`. False once the window is a
    /// single block.
    pub fn narrow(&mut self, floor: BlockNumber) -> bool {
        if self.window_size <= 1 {
            return false;
        }
        self.window_size = (self.window_size / 2).max(1);
        self.consecutive_ok = 0;
        self.place(floor);
        true
    }

    /// Count an answered window. Doubles the window size, capped at `max`,
    /// once `after` answers came in a row. Takes effect on the next advance.
    pub fn record_success(&mut self, max: u64, after: u32) -> bool {
        self.consecutive_ok += 1;
        if after == 0 || self.window_size >= max || self.consecutive_ok < after {
            return false;
        }
        self.window_size = self.window_size.saturating_mul(2).min(max);
        self.consecutive_ok = 0;
        true
    }

    /// Move to the window just below the current one. False once the
    /// current window already starts at the floor.
    pub fn advance(&mut self, floor: BlockNumber) -> bool {
        if self.window_start <= floor {
            return false;
        }
        self.window_end = self.window_start - 1;
        self.place(floor);
        true
    }
}

enum WindowResult {
    Events {
        incoming: Vec<TransferEvent>,
        outgoing: Vec<TransferEvent>,
    },
    TooWide(LedgerError),
    Failed(LedgerError),
}

/// Scans one subject's transfer history.
pub struct LogScanner<'a, L: LedgerClient> {
    ledger: &'a L,
    policy: &'a ScanPolicy,
}

impl<'a, L: LedgerClient> LogScanner<'a, L> {
    pub fn new(ledger: &'a L, policy: &'a ScanPolicy) -> Self {
        Self { ledger, policy }
    }

    /// Scan `[request.from, request.to]` backward.
    ///
    /// Never fails: windows that error are skipped and reported in the
    /// outcome. `cancel` is checked before each window.
    pub async fn scan(&self, request: &ScanRequest, cancel: &watch::Receiver<bool>) -> ScanOutcome {
        let mut outcome = ScanOutcome::new();
        if request.from > request.to {
            return outcome;
        }

        let floor = request.from;
        let mut cursor = ScanCursor::new(floor, request.to, self.policy.max_window);
        let mut found_any = false;

        loop {
            if *cancel.borrow() {
                info!(subject = %request.subject, at = cursor.window_end, "Scan cancelled");
                outcome.termination = ScanTermination::Cancelled;
                break;
            }
            if cursor.iterations >= self.policy.max_iterations {
                warn!(
                    subject = %request.subject,
                    iterations = cursor.iterations,
                    lowest = cursor.window_end,
                    "Scan hit iteration cap"
                );
                outcome.termination = ScanTermination::IterationCap;
                break;
            }
            cursor.iterations += 1;

            let (start, end) = (cursor.window_start, cursor.window_end);
            let window_empty = match self.query_window(request.subject, start, end).await {
                WindowResult::Events { incoming, outgoing } => {
                    outcome.windows_scanned += 1;
                    let empty = incoming.is_empty() && outgoing.is_empty();
                    debug!(
                        start,
                        end,
                        incoming = incoming.len(),
                        outgoing = outgoing.len(),
                        "Scanned window"
                    );
                    outcome.incoming.extend(incoming);
                    outcome.outgoing.extend(outgoing);
                    if cursor.record_success(self.policy.max_window, self.policy.widen_after) {
                        outcome.widenings += 1;
                        debug!(window_size = cursor.window_size, "Widening window");
                    }
                    empty
                }
                WindowResult::TooWide(e) => {
                    if cursor.narrow(floor) {
                        outcome.narrowings += 1;
                        debug!(start, end, window_size = cursor.window_size, "Range too wide, narrowing");
                        continue;
                    }
                    warn!(start, end, error = %e, "Single-block window still rejected, skipping");
                    cursor.consecutive_ok = 0;
                    outcome.skipped_windows.push((start, end));
                    true
                }
                WindowResult::Failed(e) => {
                    warn!(start, end, error = %e, "Window query failed, skipping");
                    cursor.consecutive_ok = 0;
                    outcome.skipped_windows.push((start, end));
                    true
                }
            };

            if window_empty {
                cursor.consecutive_empty += 1;
            } else {
                cursor.consecutive_empty = 0;
                found_any = true;
            }

            if request.stop_on_empty_run
                && found_any
                && cursor.consecutive_empty >= self.policy.max_consecutive_empty
            {
                info!(
                    subject = %request.subject,
                    lowest = cursor.window_start,
                    empty_windows = cursor.consecutive_empty,
                    "Stopping scan after empty run"
                );
                outcome.termination = ScanTermination::EmptyRun;
                break;
            }

            if !cursor.advance(floor) {
                outcome.termination = ScanTermination::ReachedFloor;
                break;
            }
        }

        info!(
            subject = %request.subject,
            from = request.from,
            to = request.to,
            windows = outcome.windows_scanned,
            events = outcome.event_count(),
            skipped = outcome.skipped_windows.len(),
            termination = ?outcome.termination,
            "Scan finished"
        );
        outcome
    }

    async fn query_window(&self, subject: Subject, start: BlockNumber, end: BlockNumber) -> WindowResult {
        let (incoming, outgoing) = tokio::join!(
            self.query_direction(TransferDirection::Incoming, subject, start, end),
            self.query_direction(TransferDirection::Outgoing, subject, start, end),
        );

        match (incoming, outgoing) {
            (Ok(incoming), Ok(outgoing)) => WindowResult::Events { incoming, outgoing },
            (Err(e @ LedgerError::RangeTooWide(_)), _) | (_, Err(e @ LedgerError::RangeTooWide(_))) => {
                WindowResult::TooWide(e)
            }
            (Err(e), _) | (_, Err(e)) => WindowResult::Failed(e),
        }
    }

    async fn query_direction(
        &self,
        direction: TransferDirection,
        subject: Subject,
        start: BlockNumber,
        end: BlockNumber,
    ) -> Result<Vec<TransferEvent>, LedgerError> {
        self.policy
            .retry_policy()
            .run(
                "transfer_logs",
                |e| matches!(e, LedgerError::RateLimited(_)),
                || self.ledger.transfer_logs(direction, subject, start, end),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use alloy_primitives::Address;

    use crate::ledger::InMemoryLedger;
    use crate::types::ItemId;

    fn policy(max_window: u64) -> ScanPolicy {
        ScanPolicy {
            max_window,
            max_consecutive_empty: 5,
            max_iterations: 10_000,
            rate_limit_retries: 3,
            rate_limit_backoff: Duration::from_millis(1),
            call_timeout: Duration::from_secs(5),
            widen_after: 0,
        }
    }

    fn request(subject: Address, from: BlockNumber, to: BlockNumber) -> ScanRequest {
        ScanRequest {
            subject,
            from,
            to,
            stop_on_empty_run: false,
        }
    }

    fn no_cancel() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    fn ids(events: &[TransferEvent]) -> BTreeSet<ItemId> {
        events.iter().map(|e| e.item_id).collect()
    }

    #[test]
    fn test_cursor_walks_down_to_floor() {
        let mut cursor = ScanCursor::new(0, 2499, 1000);
        assert_eq!((cursor.window_start, cursor.window_end), (1500, 2499));
        assert!(cursor.advance(0));
        assert_eq!((cursor.window_start, cursor.window_end), (500, 1499));
        assert!(cursor.advance(0));
        assert_eq!((cursor.window_start, cursor.window_end), (0, 499));
        assert!(!cursor.advance(0));
    }

    #[test]
    fn test_cursor_narrow_keeps_upper_bound() {
        let mut cursor = ScanCursor::new(0, 999, 1000);
        assert!(cursor.narrow(0));
        assert_eq!((cursor.window_start, cursor.window_end), (500, 999));
        let mut single = ScanCursor::new(0, 10, 1);
        assert!(!single.narrow(0));
    }

    #[test]
    fn test_cursor_widens_after_successes() {
        let mut cursor = ScanCursor::new(0, 9_999, 1000);
        assert!(cursor.narrow(0));
        assert!(cursor.narrow(0));
        assert_eq!(cursor.window_size, 250);

        assert!(!cursor.record_success(1000, 3));
        assert!(!cursor.record_success(1000, 3));
        assert!(cursor.record_success(1000, 3));
        assert_eq!(cursor.window_size, 500);

        // A narrowing restarts the streak
        cursor.record_success(1000, 3);
        cursor.narrow(0);
        assert!(!cursor.record_success(1000, 3));
        assert!(!cursor.record_success(1000, 3));
        assert!(cursor.record_success(1000, 3));
        assert_eq!(cursor.window_size, 500);

        for _ in 0..3 {
            cursor.record_success(1000, 3);
        }
        assert_eq!(cursor.window_size, 1000);
        for _ in 0..6 {
            assert!(!cursor.record_success(1000, 3));
        }
        assert_eq!(cursor.window_size, 1000);
    }

    #[test]
    fn test_cursor_never_widens_when_disabled() {
        let mut cursor = ScanCursor::new(0, 9_999, 1000);
        cursor.narrow(0);
        for _ in 0..20 {
            assert!(!cursor.record_success(1000, 0));
        }
        assert_eq!(cursor.window_size, 500);
    }

    #[tokio::test]
    async fn test_full_scan_collects_both_directions() {
        let alice = Address::repeat_byte(0xa1);
        let bob = Address::repeat_byte(0xb0);
        let ledger = InMemoryLedger::new(0);
        for id in 1..=5u64 {
            ledger.mint(alice, id, 100 + id);
        }
        ledger.transfer(alice, bob, 2u64, 200);
        ledger.transfer(alice, bob, 4u64, 20_000);
        ledger.set_tip(30_000);

        let p = policy(9000);
        let outcome = LogScanner::new(&ledger, &p)
            .scan(&request(alice, 0, 30_000), &no_cancel())
            .await;

        assert!(outcome.reached_floor());
        assert_eq!(outcome.incoming.len(), 5);
        assert_eq!(ids(&outcome.outgoing), [2u64, 4].into_iter().map(ItemId::from).collect());
        assert_eq!(outcome.windows_scanned, 4);
    }

    #[tokio::test]
    async fn test_adjacent_scans_match_single_scan() {
        let alice = Address::repeat_byte(0xa1);
        let ledger = InMemoryLedger::new(0);
        for (id, block) in [(1u64, 0u64), (2, 999), (3, 1000), (4, 1999), (5, 1500)] {
            ledger.mint(alice, id, block);
        }

        let p = policy(500);
        let scanner = LogScanner::new(&ledger, &p);
        let whole = scanner.scan(&request(alice, 0, 1999), &no_cancel()).await;
        let low = scanner.scan(&request(alice, 0, 999), &no_cancel()).await;
        let high = scanner.scan(&request(alice, 1000, 1999), &no_cancel()).await;

        let mut split: Vec<_> = low.incoming.iter().chain(high.incoming.iter()).cloned().collect();
        let mut single = whole.incoming.clone();
        split.sort_by_key(|e| e.block);
        single.sort_by_key(|e| e.block);
        assert_eq!(split, single);
        assert_eq!(single.len(), 5);
    }

    #[tokio::test]
    async fn test_narrowing_converges_without_advancing() {
        let alice = Address::repeat_byte(0xa1);
        let ledger = InMemoryLedger::new(0).with_max_range(1000);
        ledger.mint(alice, 1u64, 5);
        ledger.mint(alice, 2u64, 8_999);
        ledger.set_tip(8_999);

        let p = policy(9000);
        let outcome = LogScanner::new(&ledger, &p)
            .scan(&request(alice, 0, 8_999), &no_cancel())
            .await;

        assert!(outcome.reached_floor());
        assert_eq!(outcome.incoming.len(), 2);
        // 9000 -> 4500 -> 2250 -> 1125 -> 562
        assert_eq!(outcome.narrowings, 4);

        let windows = ledger.queried_windows();
        let rejected: Vec<_> = windows.iter().filter(|w| w.to - w.from + 1 > 1000).collect();
        assert!(rejected.iter().all(|w| w.to == 8_999));
        assert!(windows.iter().all(|w| w.to <= 8_999));
    }

    #[tokio::test]
    async fn test_widening_recovers_window_size() {
        let alice = Address::repeat_byte(0xa1);
        let ledger = InMemoryLedger::new(0).with_max_range(1000);
        for (id, block) in [(1u64, 15_500u64), (2, 9_000), (3, 4_321), (4, 0)] {
            ledger.mint(alice, id, block);
        }
        ledger.set_tip(15_999);

        let mut p = policy(4000);
        p.widen_after = 2;
        let outcome = LogScanner::new(&ledger, &p)
            .scan(&request(alice, 0, 15_999), &no_cancel())
            .await;

        assert!(outcome.reached_floor());
        assert!(outcome.skipped_windows.is_empty());
        assert_eq!(outcome.incoming.len(), 4);
        assert!(outcome.widenings > 0);
        assert!(outcome.narrowings > 2);
    }

    #[tokio::test]
    async fn test_empty_run_stops_early_once_events_found() {
        let alice = Address::repeat_byte(0xa1);
        let ledger = InMemoryLedger::new(0);
        ledger.mint(alice, 1u64, 99_950);
        ledger.mint(alice, 2u64, 10);
        ledger.set_tip(100_000);

        let p = policy(100);
        let mut req = request(alice, 0, 100_000);
        req.stop_on_empty_run = true;
        let outcome = LogScanner::new(&ledger, &p).scan(&req, &no_cancel()).await;

        assert_eq!(outcome.termination, ScanTermination::EmptyRun);
        assert_eq!(outcome.incoming.len(), 1);
        assert_eq!(outcome.windows_scanned, 6);
    }

    #[tokio::test]
    async fn test_empty_windows_before_first_event_do_not_stop() {
        let alice = Address::repeat_byte(0xa1);
        let ledger = InMemoryLedger::new(0);
        ledger.mint(alice, 1u64, 10);
        ledger.set_tip(5_000);

        let p = policy(100);
        let mut req = request(alice, 0, 5_000);
        req.stop_on_empty_run = true;
        let outcome = LogScanner::new(&ledger, &p).scan(&req, &no_cancel()).await;

        assert!(outcome.reached_floor());
        assert_eq!(outcome.incoming.len(), 1);
    }

    #[tokio::test]
    async fn test_iteration_cap() {
        let alice = Address::repeat_byte(0xa1);
        let ledger = InMemoryLedger::new(0);
        ledger.mint(alice, 1u64, 10);
        ledger.set_tip(10_000);

        let mut p = policy(100);
        p.max_iterations = 3;
        let outcome = LogScanner::new(&ledger, &p)
            .scan(&request(alice, 0, 10_000), &no_cancel())
            .await;

        assert_eq!(outcome.termination, ScanTermination::IterationCap);
        assert!(!outcome.reached_floor());
        assert_eq!(outcome.windows_scanned, 3);
        assert!(outcome.incoming.is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried() {
        let alice = Address::repeat_byte(0xa1);
        let ledger = InMemoryLedger::new(0);
        ledger.mint(alice, 1u64, 10);
        ledger.rate_limit_next(2);

        let p = policy(100);
        let outcome = LogScanner::new(&ledger, &p)
            .scan(&request(alice, 0, 10), &no_cancel())
            .await;

        assert!(outcome.skipped_windows.is_empty());
        assert_eq!(outcome.incoming.len(), 1);
    }

    #[tokio::test]
    async fn test_failing_window_is_skipped() {
        let alice = Address::repeat_byte(0xa1);
        let ledger = InMemoryLedger::new(0);
        ledger.mint(alice, 1u64, 50);
        ledger.mint(alice, 2u64, 150);
        ledger.mint(alice, 3u64, 250);
        ledger.fail_range(120, 130);

        let p = policy(100);
        let outcome = LogScanner::new(&ledger, &p)
            .scan(&request(alice, 0, 299), &no_cancel())
            .await;

        assert!(outcome.reached_floor());
        assert_eq!(outcome.skipped_windows, vec![(100, 199)]);
        assert_eq!(
            ids(&outcome.incoming),
            [1u64, 3].into_iter().map(ItemId::from).collect()
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_first_window() {
        let alice = Address::repeat_byte(0xa1);
        let ledger = InMemoryLedger::new(100);
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let p = policy(10);
        let outcome = LogScanner::new(&ledger, &p).scan(&request(alice, 0, 100), &rx).await;
        assert_eq!(outcome.termination, ScanTermination::Cancelled);
        assert!(ledger.queried_windows().is_empty());
    }
}
