//! Bounded wait-and-retry.
//!
//! # Responsibilities
//! - Poll a readiness condition at a fixed interval, a bounded number of times
//! - Report the worst-case time a caller may be blocked
//!
//! # Design Decisions
//! - Fixed interval, no jitter: the bound must be exactly
//!   `attempts × interval`
//! - The condition is checked before every sleep, so a ready target costs
//!   nothing

use std::time::Duration;

/// How long a send path may wait for a target to become ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: usize, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Upper bound on time spent in [`wait_until`](Self::wait_until).
    pub fn max_blocking(&self) -> Duration {
        self.interval
            .saturating_mul(u32::try_from(self.attempts).unwrap_or(u32::MAX))
    }

    /// Poll `ready` until it holds or the attempts are spent.
    ///
    /// Returns whether `ready` eventually held.
    pub async fn wait_until<F>(&self, mut ready: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let mut checks = 0;
        loop {
            if ready() {
                return true;
            }
            if checks >= self.attempts {
                return false;
            }
            checks += 1;
            tokio::time::sleep(self.interval).await;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            interval: Duration::from_millis(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_bound() {
        let policy = RetryPolicy::new(4, Duration::from_millis(50));
        let start = Instant::now();
        let polls = AtomicUsize::new(0);

        let ok = policy
            .wait_until(|| {
                polls.fetch_add(1, Ordering::Relaxed);
                false
            })
            .await;

        assert!(!ok);
        assert_eq!(polls.load(Ordering::Relaxed), 5);
        assert_eq!(start.elapsed(), policy.max_blocking());
    }

    #[tokio::test(start_paused = true)]
    async fn ready_condition_returns_immediately() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1));
        let start = Instant::now();
        assert!(policy.wait_until(|| true).await);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn huge_attempt_count_saturates_bound() {
        let policy = RetryPolicy::new((1usize << 32) + 1, Duration::from_millis(1));
        assert_eq!(policy.max_blocking(), Duration::from_millis(u64::from(u32::MAX)));
    }

    #[tokio::test(start_paused = true)]
    async fn becomes_ready_midway() {
        let policy = RetryPolicy::new(10, Duration::from_millis(10));
        let mut polls = 0;
        assert!(
            policy
                .wait_until(|| {
                    polls += 1;
                    polls == 3
                })
                .await
        );
    }
}
