//! The `poll_until` primitive and its error types

use std::future::Future;
use std::time::Duration;

use metrics::{counter, histogram};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::cancel::CancelToken;

/// Smallest cadence accepted between evaluations
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Timeout and cadence for a single `poll_until` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    timeout: Duration,
    interval: Duration,
}

impl PollPolicy {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            interval: interval.max(MIN_INTERVAL),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Same cadence, different timeout
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }
}

/// Failure reported by a single condition evaluation
///
/// Retryable errors are absorbed by the poller until the deadline; anything
/// else aborts the wait immediately.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConditionError {
    message: String,
    retryable: bool,
}

impl ConditionError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Result of one evaluation: `Ok(true)` when the condition holds
pub type Evaluation = Result<bool, ConditionError>;

#[derive(Debug, Error)]
pub enum PollError {
    #[error("timed out after {elapsed:?} waiting for {what}: {}", describe_last(.last))]
    DeadlineExceeded {
        what: String,
        elapsed: Duration,
        evaluations: u32,
        last: Option<ConditionError>,
    },

    #[error("cancelled after {elapsed:?} while waiting for {what}")]
    Cancelled { what: String, elapsed: Duration },

    #[error("gave up after {elapsed:?} waiting for {what}: {source}")]
    Condition {
        what: String,
        elapsed: Duration,
        #[source]
        source: ConditionError,
    },
}

impl PollError {
    /// The last error a condition reported before the wait ended, if any
    pub fn last_error(&self) -> Option<&ConditionError> {
        match self {
            PollError::DeadlineExceeded { last, .. } => last.as_ref(),
            PollError::Condition { source, .. } => Some(source),
            PollError::Cancelled { .. } => None,
        }
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, PollError::DeadlineExceeded { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PollError::Cancelled { .. })
    }
}

fn describe_last(last: &Option<ConditionError>) -> String {
    match last {
        Some(err) => err.to_string(),
        None => "condition not met".to_string(),
    }
}

/// Evaluate `condition` until it holds, fails fatally, the policy timeout
/// elapses, or `cancel` fires.
///
/// The first evaluation happens immediately; later ones follow
/// `policy.interval`. Evaluations never overlap, and a single evaluation that
/// runs past the deadline is abandoned.
pub async fn poll_until<F, Fut>(
    what: &str,
    policy: PollPolicy,
    cancel: &CancelToken,
    mut condition: F,
) -> Result<(), PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Evaluation>,
{
    let started = Instant::now();
    let deadline = started + policy.timeout;
    let mut evaluations: u32 = 0;
    let mut last: Option<ConditionError> = None;

    loop {
        if cancel.is_cancelled() {
            return Err(finish_cancelled(what, started));
        }

        evaluations += 1;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(finish_cancelled(what, started)),
            result = tokio::time::timeout_at(deadline, condition()) => result,
        };

        match outcome {
            Ok(Ok(true)) => {
                debug!(what, evaluations, elapsed = ?started.elapsed(), "Condition met");
                record(started, "done");
                return Ok(());
            }
            Ok(Ok(false)) => {
                // `last` survives a not-done result
                trace!(what, evaluations, "Condition not met yet");
            }
            Ok(Err(err)) if err.is_retryable() => {
                debug!(what, evaluations, error = %err, "Condition not met yet");
                last = Some(err);
            }
            Ok(Err(err)) => {
                record(started, "failed");
                return Err(PollError::Condition {
                    what: what.to_string(),
                    elapsed: started.elapsed(),
                    source: err,
                });
            }
            Err(_) => {
                last = Some(ConditionError::retryable(
                    "evaluation still running at the deadline",
                ));
            }
        }

        let now = Instant::now();
        if now >= deadline {
            record(started, "deadline");
            return Err(PollError::DeadlineExceeded {
                what: what.to_string(),
                elapsed: started.elapsed(),
                evaluations,
                last,
            });
        }

        let wake = (now + policy.interval).min(deadline);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(finish_cancelled(what, started)),
            _ = tokio::time::sleep_until(wake) => {}
        }
    }
}

fn finish_cancelled(what: &str, started: Instant) -> PollError {
    record(started, "cancelled");
    PollError::Cancelled {
        what: what.to_string(),
        elapsed: started.elapsed(),
    }
}

fn record(started: Instant, outcome: &'static str) {
    counter!("harness_poll_total", 1, "outcome" => outcome);
    histogram!(
        "harness_poll_duration_seconds",
        started.elapsed().as_secs_f64(),
        "outcome" => outcome
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(timeout_ms: u64, interval_ms: u64) -> PollPolicy {
        PollPolicy::new(
            Duration::from_millis(timeout_ms),
            Duration::from_millis(interval_ms),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_evaluation() {
        let mut calls = 0u32;
        let result = poll_until("third time", policy(1000, 10), &CancelToken::new(), || {
            calls += 1;
            let n = calls;
            async move { Ok(n >= 3) }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_respected() {
        let started = Instant::now();
        let err = poll_until("never", policy(100, 10), &CancelToken::new(), || async {
            Ok(false)
        })
        .await
        .unwrap_err();

        let elapsed = started.elapsed();
        assert!(err.is_deadline_exceeded());
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed <= Duration::from_millis(150), "took {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_wraps_last_error() {
        let err = poll_until("the thing", policy(50, 10), &CancelToken::new(), || async {
            Err(ConditionError::retryable("not found yet"))
        })
        .await
        .unwrap_err();

        assert_eq!(err.last_error().unwrap().message(), "not found yet");
        let message = err.to_string();
        assert!(message.contains("waiting for the thing"));
        assert!(message.ends_with("not found yet"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_stops_immediately() {
        let mut calls = 0u32;
        let err = poll_until("fatal", policy(1000, 10), &CancelToken::new(), || {
            calls += 1;
            async { Err(ConditionError::fatal("forbidden")) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls, 1);
        assert!(matches!(err, PollError::Condition { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_interval() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(25)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = poll_until("cancelled", policy(60_000, 10_000), &cancel, || async {
            Ok(false)
        })
        .await
        .unwrap_err();

        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_evaluation_is_bounded_by_deadline() {
        let started = Instant::now();
        let err = poll_until("slow", policy(100, 10), &CancelToken::new(), || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(true)
        })
        .await
        .unwrap_err();

        assert!(err.is_deadline_exceeded());
        assert!(started.elapsed() <= Duration::from_millis(150));
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let policy = PollPolicy::new(Duration::from_secs(1), Duration::ZERO);
        assert_eq!(policy.interval(), MIN_INTERVAL);
        assert_eq!(
            policy.with_timeout(Duration::from_secs(5)).timeout(),
            Duration::from_secs(5)
        );
    }
}
