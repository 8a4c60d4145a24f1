//! Integration tests for the shared concurrency budget

use blueprint::cancel::CancelToken;
use blueprint::error::UnitError;
use blueprint::scheduler::{SchedulerConfig, TaskScheduler};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn scheduler(limit: usize) -> TaskScheduler {
    TaskScheduler::new(
        &SchedulerConfig {
            max_concurrent_units: limit,
            max_provider_calls: None,
        },
        None,
    )
}

#[tokio::test]
async fn test_running_units_never_exceed_budget() {
    let scheduler = scheduler(3);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let running = running.clone();
            let peak = peak.clone();
            scheduler.submit(format!("unit-{}", i), CancelToken::new(), move |_| async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, UnitError>(i)
            })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.join().await.unwrap());
    }
    assert_eq!(results, (0..10).collect::<Vec<_>>());
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(peak.load(Ordering::SeqCst), 3);

    let stats = scheduler.stats();
    assert_eq!(stats.completed, 10);
    assert_eq!(stats.running, 0);
    assert_eq!(stats.pending, 0);
    assert!(stats.peak_running <= 3);
}

#[tokio::test]
async fn test_cancelled_queued_unit_never_starts() {
    let scheduler = scheduler(1);
    let blocker_cancel = CancelToken::new();
    let blocker = scheduler.submit("blocker", blocker_cancel.clone(), |cancel| async move {
        cancel.cancelled().await;
        Ok::<_, UnitError>(())
    });

    let started = Arc::new(AtomicUsize::new(0));
    let queued_started = started.clone();
    let queued = scheduler.submit("queued", CancelToken::new(), move |_| async move {
        queued_started.fetch_add(1, Ordering::SeqCst);
        Ok::<_, UnitError>(())
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!queued.is_started());

    queued.cancel();
    let result = queued.join().await;
    assert!(matches!(result, Err(UnitError::Cancelled { .. })));

    blocker_cancel.cancel();
    assert!(blocker.join().await.unwrap_err().is_cancelled());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(started.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failure_releases_slot_for_next_unit() {
    let scheduler = scheduler(1);
    let failing = scheduler.submit("failing", CancelToken::new(), |_| async {
        Err::<(), _>(UnitError::Aborted("boom".to_string()))
    });
    let next = scheduler.submit("next", CancelToken::new(), |_| async { Ok::<_, UnitError>(7) });

    assert!(failing.join().await.is_err());
    assert_eq!(next.join().await.unwrap(), 7);
    assert_eq!(scheduler.stats().failed, 1);
}
