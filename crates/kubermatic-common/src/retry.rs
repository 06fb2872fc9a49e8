//! Retry utilities with exponential backoff and jitter.
//!
//! Two layers live here. [`retry_with_backoff`] wraps a single async
//! operation that may fail transiently (API conflicts, network blips) and
//! retries it inline with exponential backoff and jitter. [`RetryTracker`]
//! implements the bounded per-object retry budget used by the controllers:
//! each reconcile failure for a key increments its attempt count, success
//! resets it, and once the budget is exhausted the key is dropped from
//! requeueing and the exhaustion callback fires.
//!
//! # Example
//!
//! ```ignore
//! use kubermatic_common::retry::{retry_with_backoff, RetryPolicy};
//!
//! let result = retry_with_backoff(
//!     &RetryPolicy::infinite(),
//!     "fetch_secret",
//!     || async { kube_client.get::<Secret>("my-secret").await },
//! ).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tracing::{error, warn};

/// Callback invoked when a key exhausts its retry budget.
///
/// Receives the object key and the number of attempts made.
pub type OnExhausted = Arc<dyn Fn(&str, u32) + Send + Sync>;

/// Policy for operations that may fail transiently.
///
/// Used both for inline API retries and for the per-object reconcile
/// budget. `max_attempts == 0` means unbounded.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_backoff: Duration,
    /// Maximum delay between retries
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Create a policy that retries forever with short delays
    ///
    /// Suitable for inline API retries where the caller bounds the attempts
    /// itself (e.g. conflict-retried object updates).
    pub fn infinite() -> Self {
        Self {
            max_attempts: 0,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }

    /// Backoff delay for the given 1-based attempt number, capped at max
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30);
        let delay = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exp as i32);
        Duration::from_secs_f64(delay.min(self.max_backoff.as_secs_f64()))
    }
}

/// Outcome of recording a reconcile failure for a key
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue the key after the given backoff
    Retry {
        /// 1-based attempt number that just failed
        attempt: u32,
        /// Delay before the next attempt
        backoff: Duration,
    },
    /// The key has used up its budget and must be dropped from requeueing
    Exhausted {
        /// Total failed attempts for this key
        attempts: u32,
    },
}

/// Per-object retry accounting for controller error policies.
///
/// Keys are object keys (`namespace/name` or just `name` for cluster-scoped
/// resources). The tracker is shared across reconcile invocations via the
/// controller context.
pub struct RetryTracker {
    policy: RetryPolicy,
    attempts: DashMap<String, u32>,
    on_exhausted: Option<OnExhausted>,
}

impl RetryTracker {
    /// Create a tracker with the given policy
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: DashMap::new(),
            on_exhausted: None,
        }
    }

    /// Attach a callback fired once per key when its budget is exhausted
    pub fn with_on_exhausted(mut self, callback: OnExhausted) -> Self {
        self.on_exhausted = Some(callback);
        self
    }

    /// Record a failed reconcile for the key and decide what happens next
    ///
    /// Below the budget the decision is a jittered backoff requeue. At the
    /// budget the key's count is cleared (a later event starts fresh), the
    /// exhaustion callback fires, and the caller must stop requeueing.
    pub fn record_failure(&self, key: &str) -> RetryDecision {
        let mut entry = self.attempts.entry(key.to_string()).or_insert(0);
        *entry += 1;
        let attempt = *entry;
        drop(entry);

        if self.policy.max_attempts > 0 && attempt >= self.policy.max_attempts {
            self.attempts.remove(key);
            error!(
                key = %key,
                attempts = attempt,
                "Retry budget exhausted, dropping object from requeue"
            );
            if let Some(cb) = &self.on_exhausted {
                cb(key, attempt);
            }
            return RetryDecision::Exhausted { attempts: attempt };
        }

        let backoff = jittered(self.policy.backoff_for_attempt(attempt));
        RetryDecision::Retry { attempt, backoff }
    }

    /// Clear the attempt count after a successful reconcile
    pub fn reset(&self, key: &str) {
        self.attempts.remove(key);
    }

    /// Current failed-attempt count for the key
    pub fn attempts(&self, key: &str) -> u32 {
        self.attempts.get(key).map(|e| *e).unwrap_or(0)
    }
}

/// Apply 0.5x to 1.5x jitter to a delay
fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries until success, or until `policy.max_attempts` is exhausted when
/// the policy is bounded.
///
/// # Arguments
/// * `policy` - Retry policy
/// * `operation_name` - Name for logging purposes
/// * `operation` - The async operation to retry
///
/// # Returns
/// The result of the operation, or the last error if attempts ran out.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = policy.initial_backoff;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if policy.max_attempts > 0 && attempt >= policy.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let jittered_delay = jittered(delay);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * policy.backoff_multiplier)
                        .min(policy.max_backoff.as_secs_f64()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let policy = RetryPolicy::with_max_attempts(3);
        let result: Result<i32, &str> =
            retry_with_backoff(&policy, "op", || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        };

        let result: Result<i32, &str> = retry_with_backoff(&policy, "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("fail")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        };

        let result: Result<i32, &str> = retry_with_backoff(&policy, "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("always fails")
            }
        })
        .await;

        assert_eq!(result, Err("always fails"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 0,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(8),
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.backoff_for_attempt(4), Duration::from_secs(8));
        assert_eq!(policy.backoff_for_attempt(10), Duration::from_secs(8));
    }

    /// Story: a flapping cluster burns its budget and is dropped
    ///
    /// Five consecutive reconcile failures for the same key exhaust the
    /// default budget. The exhaustion callback fires exactly once, and the
    /// counter resets so a later watch event starts a fresh budget.
    #[test]
    fn story_flapping_object_exhausts_budget_and_is_dropped() {
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        let tracker = RetryTracker::new(RetryPolicy::with_max_attempts(5)).with_on_exhausted(
            Arc::new(move |key, attempts| {
                assert_eq!(key, "cluster-fqpcvnc6v");
                assert_eq!(attempts, 5);
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );

        for expected in 1..5 {
            match tracker.record_failure("cluster-fqpcvnc6v") {
                RetryDecision::Retry { attempt, .. } => assert_eq!(attempt, expected),
                other => panic!("budget not exhausted yet, got {other:?}"),
            }
        }
        assert_eq!(
            tracker.record_failure("cluster-fqpcvnc6v"),
            RetryDecision::Exhausted { attempts: 5 }
        );
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.attempts("cluster-fqpcvnc6v"), 0);
    }

    #[test]
    fn test_success_resets_attempts() {
        let tracker = RetryTracker::new(RetryPolicy::with_max_attempts(5));
        tracker.record_failure("a");
        tracker.record_failure("a");
        assert_eq!(tracker.attempts("a"), 2);
        tracker.reset("a");
        assert_eq!(tracker.attempts("a"), 0);
    }
}
