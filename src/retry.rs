//! State-aware retry engine.
//!
//! Power and provisioning operations run against a resource whose state
//! is owned by the remote backend and can be mutated by other actors at
//! any time between calls. An operation therefore reports one of three
//! outcomes per attempt: success, "not actionable yet" (the resource is
//! in a transient state and should be re-examined after a refresh), or a
//! fault. The engine re-invokes the operation until it succeeds, the
//! deadline runs out, or a fault exhausts its retry budget.
//!
//! By convention the first attempt works on the caller's already-loaded
//! snapshot and every retried attempt re-fetches it first; the engine
//! only tracks the attempt counter, the operation does the refresh.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::api::{ApiError, Application};

/// Default wall-clock budget for a whole engine run.
const DEFAULT_DEADLINE_SECS: u64 = 600;

/// Retry policy: a deadline, a bounded backoff, and a per-HTTP-status
/// retry budget. Statuses not in the budget are fatal on first sight.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Wall-clock budget for the whole operation.
    pub deadline: Duration,
    /// Initial delay between attempts.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Remaining retries per HTTP status code.
    status_budget: HashMap<u16, u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(DEFAULT_DEADLINE_SECS),
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            status_budget: HashMap::new(),
        }
    }
}

impl RetryPolicy {
    /// Policy with the default deadline and an empty status budget.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the overall deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Set the initial backoff delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Allow `count` retries for HTTP status `status`.
    #[must_use]
    pub fn retry_status(mut self, status: u16, count: u32) -> Self {
        self.status_budget.insert(status, count);
        self
    }

    /// Consume one retry for `status`, returning the decremented policy.
    ///
    /// Returns `None` when the status has no budget entry or the entry
    /// is exhausted; the caller must then treat the fault as fatal.
    #[must_use]
    pub fn consume(&self, status: u16) -> Option<Self> {
        let remaining = *self.status_budget.get(&status)?;
        if remaining == 0 {
            return None;
        }
        let mut next = self.clone();
        next.status_budget.insert(status, remaining - 1);
        Some(next)
    }
}

/// Mutable context threaded through retried attempts.
///
/// Holds the latest resource snapshot and the zero-based attempt index.
/// The engine increments `attempt` between invocations and reads it only
/// for logging; the operation refreshes `app` whenever `attempt > 0`.
#[derive(Debug)]
pub struct AttemptState {
    /// Latest application snapshot.
    pub app: Application,
    /// Zero-based attempt counter.
    pub attempt: u32,
}

impl AttemptState {
    /// Wrap a freshly loaded snapshot for a first attempt.
    #[must_use]
    pub fn new(app: Application) -> Self {
        Self { app, attempt: 0 }
    }

    /// Whether this invocation is a retry and must re-fetch the snapshot.
    #[must_use]
    pub fn is_retry(&self) -> bool {
        self.attempt > 0
    }
}

/// Outcome of a single attempt, as reported by the operation.
#[derive(Error, Debug)]
pub enum AttemptError {
    /// The resource is not in an actionable state yet; retry after a
    /// refresh. This is a control signal, not a failure.
    #[error("{0}")]
    Busy(String),

    /// Remote API fault; retried only if its status has budget left.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Precondition or local fault; never retried.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl From<crate::Error> for AttemptError {
    fn from(err: crate::Error) -> Self {
        Self::Fatal(err.into())
    }
}

/// Terminal result of an engine run that did not succeed.
#[derive(Error, Debug)]
pub enum RetryError {
    /// Deadline exceeded while the resource was still not actionable.
    #[error("timed out after {deadline:?}: {reason}")]
    Timeout { deadline: Duration, reason: String },

    /// Remote fault with no (or exhausted) retry budget.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Escalated precondition or local fault.
    #[error(transparent)]
    Fatal(anyhow::Error),
}

/// Run `op` until it succeeds, the deadline passes, or a fault escalates.
///
/// Attempts are strictly sequential; at most one remote call chain is in
/// flight at a time. The backoff grows exponentially up to
/// `policy.max_delay` and a sleep is only taken when it still fits
/// within the deadline, so a run never oversleeps its budget by more
/// than one interval.
///
/// # Errors
/// [`RetryError::Timeout`] when the deadline passes while the operation
/// keeps signalling busy, [`RetryError::Api`] for a fault outside (or
/// beyond) the status budget, [`RetryError::Fatal`] for escalated
/// precondition faults.
pub async fn run<T>(
    policy: &RetryPolicy,
    name: &str,
    state: &mut AttemptState,
    mut op: impl AsyncFnMut(&mut AttemptState) -> Result<T, AttemptError>,
) -> Result<T, RetryError> {
    let start = Instant::now();
    let mut policy = policy.clone();
    let mut delay = policy.initial_delay;

    loop {
        match op(state).await {
            Ok(value) => {
                debug!(operation = name, attempts = state.attempt + 1, "Operation succeeded");
                return Ok(value);
            }
            Err(AttemptError::Busy(reason)) => {
                debug!(
                    operation = name,
                    attempt = state.attempt,
                    reason = %reason,
                    "Not actionable yet"
                );
                if start.elapsed() + delay >= policy.deadline {
                    return Err(RetryError::Timeout {
                        deadline: policy.deadline,
                        reason,
                    });
                }
                tokio::time::sleep(delay).await;
            }
            Err(AttemptError::Api(err)) => {
                let Some(status) = err.status() else {
                    return Err(err.into());
                };
                let Some(decremented) = policy.consume(status) else {
                    return Err(err.into());
                };
                warn!(
                    operation = name,
                    attempt = state.attempt,
                    status,
                    error = %err,
                    "Retryable API fault"
                );
                if start.elapsed() + delay >= policy.deadline {
                    return Err(err.into());
                }
                policy = decremented;
                tokio::time::sleep(delay).await;
            }
            Err(AttemptError::Fatal(err)) => return Err(RetryError::Fatal(err)),
        }

        state.attempt += 1;
        delay = std::cmp::min(
            policy.max_delay,
            Duration::from_secs_f64(delay.as_secs_f64() * policy.backoff_multiplier),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_app() -> Application {
        serde_json::from_value(serde_json::json!({"id": 1, "name": "test"})).unwrap()
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new()
            .with_deadline(Duration::from_millis(500))
            .with_initial_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_busy_then_success_invocation_count() {
        // Signals busy exactly k times, then succeeds: k+1 invocations.
        let k = 3;
        let mut state = AttemptState::new(empty_app());
        let mut calls = 0u32;

        let result = run(&fast_policy(), "test", &mut state, async |st| {
            calls += 1;
            if st.attempt < k {
                Err(AttemptError::Busy("still transitioning".into()))
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls, k + 1);
        assert_eq!(state.attempt, k);
    }

    #[tokio::test]
    async fn test_status_budget_exhaustion() {
        // Always 409 with a budget of 3: exactly 4 attempts, then fatal.
        let policy = fast_policy().retry_status(409, 3);
        let mut state = AttemptState::new(empty_app());
        let mut calls = 0u32;

        let err = run(&policy, "test", &mut state, async |_st| {
            calls += 1;
            Err::<(), _>(AttemptError::Api(ApiError::Api {
                status: 409,
                message: "conflict".into(),
            }))
        })
        .await
        .unwrap_err();

        assert_eq!(calls, 4);
        match err {
            RetryError::Api(ApiError::Api { status, .. }) => assert_eq!(status, 409),
            other => panic!("expected API fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unbudgeted_status_is_fatal_first_time() {
        let mut state = AttemptState::new(empty_app());
        let mut calls = 0u32;

        let err = run(&fast_policy(), "test", &mut state, async |_st| {
            calls += 1;
            Err::<(), _>(AttemptError::Api(ApiError::Api {
                status: 500,
                message: "boom".into(),
            }))
        })
        .await
        .unwrap_err();

        assert_eq!(calls, 1);
        assert!(matches!(err, RetryError::Api(_)));
    }

    #[tokio::test]
    async fn test_deadline_shorter_than_backoff_times_out() {
        // Deadline shorter than one backoff interval: the engine must
        // report a timeout without sleeping past the deadline.
        let policy = RetryPolicy::new()
            .with_deadline(Duration::from_millis(50))
            .with_initial_delay(Duration::from_millis(100));
        let mut state = AttemptState::new(empty_app());

        let started = Instant::now();
        let err = run(&policy, "test", &mut state, async |_st| {
            Err::<(), _>(AttemptError::Busy("state STARTING".into()))
        })
        .await
        .unwrap_err();

        assert!(started.elapsed() < Duration::from_millis(100));
        match err {
            RetryError::Timeout { reason, .. } => assert_eq!(reason, "state STARTING"),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let mut state = AttemptState::new(empty_app());
        let mut calls = 0u32;

        let err = run(&fast_policy(), "test", &mut state, async |_st| {
            calls += 1;
            Err::<(), _>(AttemptError::from(crate::Error::UnknownNode("node9".into())))
        })
        .await
        .unwrap_err();

        assert_eq!(calls, 1);
        assert!(matches!(err, RetryError::Fatal(_)));
    }

    #[test]
    fn test_consume_is_immutable() {
        let policy = RetryPolicy::new().retry_status(409, 1);
        let once = policy.consume(409).unwrap();
        // Original is untouched; the decremented copy is exhausted.
        assert!(policy.consume(409).is_some());
        assert!(once.consume(409).is_none());
        assert!(policy.consume(500).is_none());
    }
}
