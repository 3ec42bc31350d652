//! Backoff handling for throttled provider calls.
//!
//! CloudFormation rate-limits aggressively under load. Throttling is a
//! transient condition that must never surface as a reconcile failure, so
//! calls are retried in place with exponentially growing, jittered delays.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{CfnError, Result};

/// Floor for the first retry delay.
pub const MIN_DELAY: Duration = Duration::from_secs(1);
/// Cap for retry delays.
pub const MAX_DELAY: Duration = Duration::from_secs(120);
/// Multiplier applied between consecutive delays.
pub const FACTOR: u32 = 3;

/// Exponential backoff schedule: `min, min*factor, min*factor^2, ...`
/// capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    factor: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(MIN_DELAY, MAX_DELAY, FACTOR)
    }
}

impl Backoff {
    /// Create a schedule with the given bounds and growth factor.
    #[must_use]
    pub fn new(min: Duration, max: Duration, factor: u32) -> Self {
        Self {
            next: min,
            max,
            factor,
        }
    }

    /// Return the next delay and advance the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let current = self.next;
        self.next = (current * self.factor).min(self.max);
        current
    }
}

/// Spread a delay uniformly over `[delay/2, delay]` so synchronized
/// reconcilers do not retry in lockstep.
#[must_use]
pub fn with_jitter(delay: Duration) -> Duration {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    let half = delay_ms / 2;
    Duration::from_millis(half + rand::thread_rng().gen_range(0..=half))
}

/// Run a provider call, retrying in place while it reports throttling.
///
/// Every other outcome, success or failure, is returned to the caller
/// unchanged.
///
/// # Errors
///
/// Returns whatever non-throttling error the call produces.
pub async fn with_backoff<T, F, Fut>(operation: &'static str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Backoff::default();
    loop {
        match call().await {
            Err(CfnError::Throttled(reason)) => {
                let delay = with_jitter(backoff.next_delay());
                tracing::warn!(
                    operation,
                    reason = %reason,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "provider throttled, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn delays_grow_by_factor_and_cap() {
        let mut backoff = Backoff::default();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(3));
        assert_eq!(backoff.next_delay(), Duration::from_secs(9));
        assert_eq!(backoff.next_delay(), Duration::from_secs(27));
        assert_eq!(backoff.next_delay(), Duration::from_secs(81));
        // Capped from here on.
        assert_eq!(backoff.next_delay(), Duration::from_secs(120));
        assert_eq!(backoff.next_delay(), Duration::from_secs(120));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let delay = Duration::from_secs(10);
        for _ in 0..100 {
            let jittered = with_jitter(delay);
            assert!(jittered >= delay / 2);
            assert!(jittered <= delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_throttled_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result = with_backoff("DescribeStacks", move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CfnError::Throttled("Rate exceeded".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_throttling_errors_pass_through() {
        let result: Result<()> = with_backoff("CreateStack", || async {
            Err(CfnError::Api {
                operation: "CreateStack",
                message: "template format error".to_string(),
            })
        })
        .await;

        assert!(matches!(result, Err(CfnError::Api { .. })));
    }
}
