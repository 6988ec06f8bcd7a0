//! Bounded ledger calls: per-call timeout plus exponential backoff

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::ledger::LedgerError;

/// Backoff settings for retried ledger calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub retries: u32,
    pub base_delay: Duration,
    /// Upper bound on each individual attempt
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_millis(500),
            call_timeout: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }

    /// Run `op`, retrying errors accepted by `should_retry` with backoff.
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        should_retry: impl Fn(&LedgerError) -> bool,
        mut op: F,
    ) -> Result<T, LedgerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let mut attempt = 0;
        loop {
            match with_timeout(self.call_timeout, op()).await {
                Err(e) if attempt < self.retries && should_retry(&e) => {
                    attempt += 1;
                    let delay = self.delay_for(attempt);
                    debug!(call = what, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying ledger call");
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}

/// Bound a ledger call, mapping elapsed time to [`LedgerError::Timeout`].
pub async fn with_timeout<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, LedgerError>>,
) -> Result<T, LedgerError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(LedgerError::Timeout),
    }
}
