//! Retry policy for transient store conflicts.
//!
//! Serialization failures and deadlocks are expected under concurrent
//! dispatchers. A [`RetryPolicy`] re-runs a unit of work after rolling back,
//! waiting `min(max_wait, min_wait * 2^(failures - 1))` between attempts.
//! The first attempt never waits.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff schedule with a bounded number of retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = run once).
    pub retries: u32,
    /// Wait after the first failure.
    pub min_wait: Duration,
    /// Cap on any single wait.
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 6,
            min_wait: Duration::from_millis(100),
            max_wait: Duration::from_secs(10),
        }
    }
}

/// Outcome of a unit of work that did not succeed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// A non-retryable error; returned unchanged after the first occurrence.
    Fatal(E),
    /// Every permitted attempt hit a retryable error; holds the last one.
    Exhausted { attempts: u32, source: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Fatal(e) => e,
            RetryError::Exhausted { source, .. } => source,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, min_wait: Duration, max_wait: Duration) -> Self {
        Self {
            retries,
            min_wait,
            max_wait,
        }
    }

    /// Policy used around autoflush-adjacent `flush` deliveries:
    /// a larger budget with short waits.
    pub fn for_flush() -> Self {
        Self {
            retries: 10,
            min_wait: Duration::from_millis(100),
            max_wait: Duration::from_secs(1),
        }
    }

    /// Run once, never retry.
    pub fn no_retry() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    /// Wait before the next attempt after `failures` consecutive failures (1-indexed).
    pub fn delay_for_failure(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1_u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.min_wait
            .checked_mul(factor)
            .unwrap_or(Duration::MAX)
            .min(self.max_wait)
    }

    /// Total attempts this policy permits.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Run `action`, retrying retryable failures.
    ///
    /// `rollback` is invoked on the context after every retryable failure,
    /// before waiting. Non-retryable failures are returned immediately
    /// without a rollback; the caller owns that cleanup.
    pub fn run_with<C, T, E>(
        &self,
        ctx: &mut C,
        is_retryable: impl Fn(&E) -> bool,
        mut rollback: impl FnMut(&mut C),
        mut action: impl FnMut(&mut C) -> Result<T, E>,
    ) -> Result<T, RetryError<E>> {
        let mut failures: u32 = 0;
        loop {
            match action(ctx) {
                Ok(value) => return Ok(value),
                Err(err) if !is_retryable(&err) => return Err(RetryError::Fatal(err)),
                Err(err) => {
                    failures += 1;
                    if failures > self.retries {
                        return Err(RetryError::Exhausted {
                            attempts: failures,
                            source: err,
                        });
                    }
                    rollback(ctx);
                    let delay = self.delay_for_failure(failures);
                    tracing::warn!(
                        attempt = failures,
                        retries = self.retries,
                        delay_ms = delay.as_millis() as u64,
                        "serialization conflict, retrying"
                    );
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
            }
        }
    }

    /// Like [`run_with`](Self::run_with) for actions without a rollback context.
    pub fn run<T, E>(
        &self,
        is_retryable: impl Fn(&E) -> bool,
        mut action: impl FnMut() -> Result<T, E>,
    ) -> Result<T, RetryError<E>> {
        self.run_with(&mut (), is_retryable, |_| {}, |_| action())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, PartialEq)]
    enum Failure {
        Conflict,
        Broken,
    }

    fn instant(retries: u32) -> RetryPolicy {
        RetryPolicy::new(retries, Duration::ZERO, Duration::ZERO)
    }

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_failure(0), Duration::ZERO);
        assert_eq!(policy.delay_for_failure(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_failure(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_failure(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_failure(20), Duration::from_secs(10));
        assert_eq!(RetryPolicy::for_flush().delay_for_failure(5), Duration::from_secs(1));
    }

    #[test]
    fn succeeds_after_transient_conflicts() {
        let mut rollbacks = 0;
        let mut calls = 0;
        let result = instant(3).run_with(
            &mut rollbacks,
            |e: &Failure| *e == Failure::Conflict,
            |n| *n += 1,
            |_| {
                calls += 1;
                if calls < 3 { Err(Failure::Conflict) } else { Ok(calls) }
            },
        );
        assert_eq!(result.unwrap(), 3);
        assert_eq!(rollbacks, 2);
    }

    #[test]
    fn exhausts_after_retries_plus_one_attempts() {
        let mut calls = 0;
        let result: Result<(), _> = instant(2).run(
            |e: &Failure| *e == Failure::Conflict,
            || {
                calls += 1;
                Err(Failure::Conflict)
            },
        );
        match result {
            Err(RetryError::Exhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert_eq!(source, Failure::Conflict);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(calls, 3);
    }

    #[test]
    fn non_retryable_errors_propagate_at_once() {
        let mut calls = 0;
        let mut rollbacks = 0;
        let result: Result<(), _> = instant(5).run_with(
            &mut rollbacks,
            |e: &Failure| *e == Failure::Conflict,
            |n| *n += 1,
            |_| {
                calls += 1;
                Err(Failure::Broken)
            },
        );
        assert!(matches!(result, Err(RetryError::Fatal(Failure::Broken))));
        assert_eq!(calls, 1);
        assert_eq!(rollbacks, 0);
    }

    proptest! {
        /// The schedule is non-decreasing and never exceeds the cap.
        #[test]
        fn schedule_is_monotonic_and_capped(min_ms in 0u64..5_000, max_ms in 0u64..60_000, failures in 1u32..100) {
            let policy = RetryPolicy::new(10, Duration::from_millis(min_ms), Duration::from_millis(max_ms));
            let this = policy.delay_for_failure(failures);
            let next = policy.delay_for_failure(failures + 1);
            prop_assert!(this <= next);
            prop_assert!(next <= Duration::from_millis(max_ms));
        }
    }
}
