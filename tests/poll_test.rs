//! Timing and cancellation behaviour of `poll_until`

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_test::assert_ok;

use dsi_harness::poll::{poll_until, CancelToken, ConditionError, PollError, PollPolicy};

fn policy(timeout_ms: u64, interval_ms: u64) -> PollPolicy {
    PollPolicy::new(
        Duration::from_millis(timeout_ms),
        Duration::from_millis(interval_ms),
    )
}

#[tokio::test(start_paused = true)]
async fn test_condition_true_on_third_evaluation() {
    let calls = AtomicU32::new(0);
    let started = Instant::now();

    assert_ok!(
        poll_until("third time lucky", policy(1000, 10), &CancelToken::new(), || async {
            Ok(calls.fetch_add(1, Ordering::SeqCst) + 1 == 3)
        })
        .await
    );

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(started.elapsed(), Duration::from_millis(20));
}

#[tokio::test(start_paused = true)]
async fn test_never_true_times_out_within_bound() {
    let started = Instant::now();

    let err = poll_until("never", policy(100, 10), &CancelToken::new(), || async {
        Ok(false)
    })
    .await
    .unwrap_err();

    let elapsed = started.elapsed();
    assert!(err.is_deadline_exceeded());
    assert!(elapsed >= Duration::from_millis(100), "{:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(150), "{:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_reports_last_error() {
    let err = poll_until(
        "fault to become active",
        policy(50, 10),
        &CancelToken::new(),
        || async { Err(ConditionError::retryable("podchaos f not injected yet")) },
    )
    .await
    .unwrap_err();

    assert_eq!(
        err.last_error().map(ConditionError::message),
        Some("podchaos f not injected yet")
    );
    let message = err.to_string();
    assert!(message.starts_with("timed out after"), "{}", message);
    assert!(
        message.ends_with("waiting for fault to become active: podchaos f not injected yet"),
        "{}",
        message
    );
}

#[tokio::test(start_paused = true)]
async fn test_not_done_keeps_earlier_error() {
    let calls = AtomicU32::new(0);
    let err = poll_until("primary to fail over", policy(100, 10), &CancelToken::new(), || async {
        if calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            Err(ConditionError::retryable("connection refused"))
        } else {
            Ok(false)
        }
    })
    .await
    .unwrap_err();

    assert!(err.is_deadline_exceeded());
    assert_eq!(
        err.last_error().map(ConditionError::message),
        Some("connection refused")
    );
    assert!(err.to_string().ends_with("connection refused"), "{}", err);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_returned_immediately() {
    let calls = AtomicU32::new(0);
    let err = poll_until("forbidden", policy(1000, 10), &CancelToken::new(), || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(ConditionError::fatal("403 forbidden"))
    })
    .await
    .unwrap_err();

    assert!(matches!(err, PollError::Condition { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_from_another_task_is_prompt() {
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(35)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = poll_until("slow cadence", policy(60_000, 10_000), &cancel, || async {
        Ok(false)
    })
    .await
    .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(started.elapsed(), Duration::from_millis(35));
}

#[tokio::test(start_paused = true)]
async fn test_already_cancelled_never_evaluates() {
    let cancel = CancelToken::new();
    cancel.cancel();
    let calls = AtomicU32::new(0);

    let err = poll_until("cancelled", policy(1000, 10), &cancel, || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    })
    .await
    .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_evaluations_never_overlap() {
    let running = Arc::new(AtomicBool::new(false));
    let calls = AtomicU32::new(0);

    poll_until("sequential", policy(1000, 1), &CancelToken::new(), || {
        let running = Arc::clone(&running);
        let n = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            assert!(!running.swap(true, Ordering::SeqCst), "overlapping evaluation");
            tokio::time::sleep(Duration::from_millis(5)).await;
            running.store(false, Ordering::SeqCst);
            Ok(n == 4)
        }
    })
    .await
    .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test(start_paused = true)]
async fn test_not_found_semantics_belong_to_condition() {
    // the same "missing" observation means success for a deletion wait and
    // not-ready for a readiness wait
    let missing = || async { None::<()> };

    assert_ok!(
        poll_until("deleted", policy(100, 10), &CancelToken::new(), || async {
            Ok(missing().await.is_none())
        })
        .await
    );

    let err = poll_until("ready", policy(100, 10), &CancelToken::new(), || async {
        match missing().await {
            Some(()) => Ok(true),
            None => Err(ConditionError::retryable("not found")),
        }
    })
    .await
    .unwrap_err();
    assert!(err.is_deadline_exceeded());
}
