use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sourcegate::batch::{
    BatchPlan, Classify, ErrorKind, OverloadSignal, RetryPolicy, retry_with_backoff,
    run_in_batches,
};

mod test_helpers {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub struct TestError {
        pub kind: ErrorKind,
        pub tag: usize,
    }

    impl Classify for TestError {
        fn kind(&self) -> ErrorKind {
            self.kind
        }
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{} #{}", self.kind, self.tag)
        }
    }

    pub fn fast_policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            retry_delay: Duration::from_millis(100),
            ..RetryPolicy::default()
        }
    }

    /// Tracks how many calls are in flight at once.
    #[derive(Default)]
    pub struct InFlight {
        current: AtomicUsize,
        pub max: AtomicUsize,
    }

    impl InFlight {
        pub fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max.fetch_max(now, Ordering::SeqCst);
        }

        pub fn leave(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

use test_helpers::*;

#[tokio::test(start_paused = true)]
async fn test_results_are_positional_with_partial_failures() {
    let signal = OverloadSignal::new();
    let plan = BatchPlan::new(3, Duration::from_secs(1));
    let items: Vec<usize> = (0..8).collect();

    let results = run_in_batches(
        items,
        |i| async move {
            // Later items finish first inside a batch.
            tokio::time::sleep(Duration::from_millis(100 * (10 - i as u64))).await;
            if i % 3 == 1 {
                Err(TestError {
                    kind: ErrorKind::Api,
                    tag: i,
                })
            } else {
                Ok(i * 10)
            }
        },
        &plan,
        &signal,
    )
    .await;

    assert_eq!(results.len(), 8);
    for (i, result) in results.iter().enumerate() {
        if i % 3 == 1 {
            assert_eq!(
                result,
                &Err(TestError {
                    kind: ErrorKind::Api,
                    tag: i
                })
            );
        } else {
            assert_eq!(result, &Ok(i * 10));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_batch_members_run_concurrently_and_batches_in_sequence() {
    let signal = OverloadSignal::new();
    let plan = BatchPlan::new(4, Duration::from_secs(30));
    let in_flight = Arc::new(InFlight::default());

    let start = tokio::time::Instant::now();
    let results: Vec<Result<(), TestError>> = run_in_batches(
        (0..10).collect::<Vec<usize>>(),
        |_| {
            let in_flight = in_flight.clone();
            async move {
                in_flight.enter();
                tokio::time::sleep(Duration::from_secs(1)).await;
                in_flight.leave();
                Ok(())
            }
        },
        &plan,
        &signal,
    )
    .await;

    assert_eq!(results.len(), 10);
    assert_eq!(in_flight.max.load(Ordering::SeqCst), 4);
    // Three batches, no overload, no backoff.
    assert_eq!(start.elapsed(), Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_backoff_happens_once_after_overloaded_batch() {
    let signal = OverloadSignal::new();
    let plan = BatchPlan::new(2, Duration::from_secs(10));
    let seen_mid_batch = Arc::new(AtomicUsize::new(0));

    let start = tokio::time::Instant::now();
    let results: Vec<Result<usize, TestError>> = run_in_batches(
        (0..6).collect::<Vec<usize>>(),
        |i| {
            let signal = signal.clone();
            let seen_mid_batch = seen_mid_batch.clone();
            async move {
                if i == 0 {
                    signal.set();
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
                if i == 1 && signal.is_set() {
                    // The sibling's signal is still visible inside the batch.
                    seen_mid_batch.fetch_add(1, Ordering::SeqCst);
                }
                Ok(i)
            }
        },
        &plan,
        &signal,
    )
    .await;

    assert_eq!(results.len(), 6);
    assert_eq!(seen_mid_batch.load(Ordering::SeqCst), 1);
    // 3 batches of 1s plus a single 10s backoff before batch 2.
    assert_eq!(start.elapsed(), Duration::from_secs(13));
    assert!(!signal.is_set());
}

#[tokio::test(start_paused = true)]
async fn test_inter_batch_delay_applies_between_batches_only() {
    let signal = OverloadSignal::new();
    let plan = BatchPlan::new(2, Duration::from_secs(10)).with_inter_batch_delay(Duration::from_secs(2));

    let start = tokio::time::Instant::now();
    let results: Vec<Result<usize, TestError>> = run_in_batches(
        (0..5).collect::<Vec<usize>>(),
        |i| async move { Ok(i) },
        &plan,
        &signal,
    )
    .await;

    assert_eq!(results.len(), 5);
    assert_eq!(start.elapsed(), Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn test_retry_recovers_from_transient_errors() {
    let calls = AtomicUsize::new(0);
    let policy = fast_policy(3);

    let result = retry_with_backoff(
        || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TestError {
                        kind: ErrorKind::Timeout,
                        tag: n,
                    })
                } else {
                    Ok("done")
                }
            }
        },
        &policy,
        None,
    )
    .await;

    assert_eq!(result, Ok("done"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_retry_propagates_non_retryable_immediately() {
    let calls = AtomicUsize::new(0);
    let signal = OverloadSignal::new();

    let result: Result<(), TestError> = retry_with_backoff(
        || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                Err(TestError {
                    kind: ErrorKind::Api,
                    tag: n,
                })
            }
        },
        &fast_policy(5),
        Some(&signal),
    )
    .await;

    assert_eq!(
        result,
        Err(TestError {
            kind: ErrorKind::Api,
            tag: 0
        })
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!signal.is_set());
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_returns_last_error_and_sets_overload() {
    let calls = AtomicUsize::new(0);
    let signal = OverloadSignal::new();

    let start = tokio::time::Instant::now();
    let result: Result<(), TestError> = retry_with_backoff(
        || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                Err(TestError {
                    kind: ErrorKind::RateLimited,
                    tag: n,
                })
            }
        },
        &fast_policy(2),
        Some(&signal),
    )
    .await;

    assert_eq!(
        result,
        Err(TestError {
            kind: ErrorKind::RateLimited,
            tag: 2
        })
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(signal.is_set());
    assert_eq!(start.elapsed(), Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn test_custom_retry_table_is_honoured() {
    let calls = AtomicUsize::new(0);
    let policy = RetryPolicy {
        max_retries: 4,
        retry_delay: Duration::from_millis(1),
        retryable: vec![ErrorKind::Server],
    };

    let result: Result<(), TestError> = retry_with_backoff(
        || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                Err(TestError {
                    kind: ErrorKind::Timeout,
                    tag: n,
                })
            }
        },
        &policy,
        None,
    )
    .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
