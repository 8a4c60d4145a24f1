//! Integration tests for retry classification and backoff

use blueprint::cancel::CancelToken;
use blueprint::error::{ProviderError, ProviderErrorKind, UnitError};
use blueprint::retry::{RetryConfig, RetryPolicy};
use proptest::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(RetryConfig {
        max_attempts,
        base_delay_ms: 1,
        max_delay_ms: 4,
        call_timeout_ms: 200,
        jitter: true,
        seed: Some(3),
    })
}

#[tokio::test]
async fn test_transient_errors_retry_until_success() {
    let policy = policy(4);
    let calls = AtomicU32::new(0);
    let result = policy
        .run("u", &CancelToken::new(), None, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(ProviderError::rate_limit("slow down"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
    assert_eq!(result.unwrap(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_fatal_error_is_not_retried() {
    let policy = policy(4);
    let calls = AtomicU32::new(0);
    let result: Result<(), _> = policy
        .run("u", &CancelToken::new(), None, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::auth("invalid key")) }
        })
        .await;
    match result {
        Err(UnitError::Fatal {
            kind,
            attempts,
            retries_exhausted,
            ..
        }) => {
            assert_eq!(kind, ProviderErrorKind::Auth);
            assert_eq!(attempts, 1);
            assert!(!retries_exhausted);
        }
        other => panic!("expected fatal error, got {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_exhausted_retries_report_attempt_count() {
    let policy = policy(3);
    let result: Result<(), _> = policy
        .run("u", &CancelToken::new(), None, |_| async {
            Err(ProviderError::network("connection reset"))
        })
        .await;
    match result {
        Err(UnitError::Fatal {
            attempts,
            retries_exhausted,
            ..
        }) => {
            assert_eq!(attempts, 3);
            assert!(retries_exhausted);
        }
        other => panic!("expected exhausted retries, got {:?}", other),
    }
}

#[tokio::test]
async fn test_slow_attempt_times_out_and_retries() {
    let policy = policy(2);
    let result = policy
        .run("u", &CancelToken::new(), None, |attempt| async move {
            if attempt == 1 {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok::<_, ProviderError>(attempt)
        })
        .await;
    assert_eq!(result.unwrap(), 2);
}

#[tokio::test]
async fn test_cancel_stops_backoff() {
    let policy = RetryPolicy::new(RetryConfig {
        max_attempts: 5,
        base_delay_ms: 10_000,
        max_delay_ms: 10_000,
        call_timeout_ms: 1_000,
        jitter: false,
        seed: None,
    });
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let result: Result<(), _> = tokio::time::timeout(
        Duration::from_secs(2),
        policy.run("u", &cancel, None, |_| async {
            Err(ProviderError::network("down"))
        }),
    )
    .await
    .expect("cancellation must interrupt the backoff sleep");
    assert!(result.unwrap_err().is_cancelled());
}

proptest! {
    #[test]
    fn test_backoff_is_capped_and_monotone(base in 1u64..500, cap in 1u64..5_000, retry in 0u32..40) {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 3,
            base_delay_ms: base,
            max_delay_ms: cap.max(base),
            call_timeout_ms: 1_000,
            jitter: true,
            seed: Some(11),
        });
        let capped = policy.capped_delay(retry);
        prop_assert!(capped <= Duration::from_millis(cap.max(base)));
        prop_assert!(policy.capped_delay(retry + 1) >= capped);

        let jittered = policy.backoff_delay(retry);
        prop_assert!(jittered >= capped);
        prop_assert!(jittered <= capped + capped / 2 + Duration::from_millis(1));
    }
}
