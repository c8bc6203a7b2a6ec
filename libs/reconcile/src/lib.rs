//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing loops that converge actual
//! state to desired state. Key concepts:
//!
//! - **Desired state**: What should be running (e.g. the set of known projects).
//! - **Actual state**: What is running (e.g. the registry of consumer loops).
//! - **Convergence**: Starting what is missing and stopping what is stale.
//!
//! # Invariants
//!
//! - Diffing is pure and deterministic given the same inputs
//! - Retries are bounded; exhausting them is always surfaced to the caller

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

/// Default reconciliation interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of attempts for [`retry`].
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Default fixed backoff between attempts for [`retry`].
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(10);

/// Retry errors.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed.
    #[error("{operation} failed after {attempts} attempts: {last}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last: E,
    },

    /// The policy allows no attempts at all.
    #[error("{operation} was not attempted: retry policy allows zero attempts")]
    NoAttempts { operation: String },
}

/// Fixed-backoff retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,

    /// Delay between consecutive attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

/// Run `op` until it succeeds or `policy.max_attempts` attempts have failed.
///
/// Sleeps `policy.backoff` between attempts (not after the last one).
pub async fn retry<T, E, F, Fut>(
    operation: &str,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut last = None;
    for attempt in 1..=policy.max_attempts {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                warn!(
                    operation,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "Operation failed"
                );
                last = Some(e);
                if attempt < policy.max_attempts {
                    tokio::time::sleep(policy.backoff).await;
                }
            }
        }
    }

    match last {
        Some(last) => Err(RetryError::Exhausted {
            operation: operation.to_string(),
            attempts: policy.max_attempts,
            last,
        }),
        None => Err(RetryError::NoAttempts {
            operation: operation.to_string(),
        }),
    }
}

/// Difference between a desired key set and the keys actually present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDiff<K> {
    /// Keys that are desired but not present (to start).
    pub added: Vec<K>,

    /// Keys that are present but no longer desired (to stop).
    pub removed: Vec<K>,
}

impl<K> KeyDiff<K> {
    /// Returns true if desired and actual state already agree.
    pub fn is_converged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Compute which keys must be started and which must be stopped.
///
/// Output vectors are sorted, so the result is deterministic regardless of the
/// iteration order of the inputs.
pub fn diff_keys<'a, K, D, A>(desired: D, actual: A) -> KeyDiff<K>
where
    K: Ord + Clone + 'a,
    D: IntoIterator<Item = &'a K>,
    A: IntoIterator<Item = &'a K>,
{
    let desired: BTreeSet<&K> = desired.into_iter().collect();
    let actual: BTreeSet<&K> = actual.into_iter().collect();

    KeyDiff {
        added: desired.difference(&actual).map(|k| (*k).clone()).collect(),
        removed: actual.difference(&desired).map(|k| (*k).clone()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn test_diff_keys() {
        let desired = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let mut actual = HashMap::new();
        actual.insert("b".to_string(), ());
        actual.insert("d".to_string(), ());

        let diff = diff_keys(&desired, actual.keys());
        assert_eq!(diff.added, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(diff.removed, vec!["d".to_string()]);
        assert!(!diff.is_converged());
    }

    #[test]
    fn test_diff_keys_converged() {
        let keys = vec![1, 2, 3];
        let diff = diff_keys(&keys, &keys);
        assert!(diff.is_converged());
    }

    #[test]
    fn test_diff_keys_ignores_duplicates() {
        let desired = vec![1, 1, 2];
        let actual: Vec<i32> = vec![];
        let diff = diff_keys(&desired, &actual);
        assert_eq!(diff.added, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff: Duration::from_secs(10),
        };

        let result: Result<u32, RetryError<String>> = retry("dial", policy, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("attempt {n} refused"))
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
        };
        let started = tokio::time::Instant::now();

        let result: Result<(), RetryError<String>> = retry("dial", policy, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("refused".to_string())
        })
        .await;

        match result {
            Err(RetryError::Exhausted { attempts, last, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last, "refused");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two sleeps between three attempts.
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_retry_zero_attempts() {
        let policy = RetryPolicy {
            max_attempts: 0,
            backoff: Duration::ZERO,
        };
        let result: Result<(), RetryError<String>> =
            retry("dial", policy, || async { Ok(()) }).await;
        assert!(matches!(result, Err(RetryError::NoAttempts { .. })));
    }
}
