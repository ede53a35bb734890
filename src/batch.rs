//! Rate-limit aware execution shared by every API-bound stage.
//!
//! Two primitives:
//!
//! * [`retry_with_backoff`] decides retry vs. propagate for a single call.
//! * [`run_in_batches`] runs calls batch by batch and backs off between
//!   batches only after some call reported overload.
//!
//! The [`OverloadSignal`] is the only state shared between concurrent calls.
//! Calls may set it at any time; it is inspected and cleared only at a batch
//! boundary.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;

pub use crate::errors::{Classify, ErrorKind};

const DEFAULT_RETRYABLE: &[ErrorKind] = &[
    ErrorKind::RateLimited,
    ErrorKind::Overloaded,
    ErrorKind::Timeout,
    ErrorKind::Connection,
    ErrorKind::Server,
];

/// Shared "somebody got rate limited" flag. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct OverloadSignal(Arc<AtomicBool>);

impl OverloadSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent.
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clears the flag and reports whether it was set.
    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub retry_delay: Duration,
    pub retryable: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            retryable: DEFAULT_RETRYABLE.to_vec(),
        }
    }
}

impl RetryPolicy {
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable.contains(&kind)
    }
}

/// Invoke `call`, retrying retryable failures up to `policy.max_retries`
/// times with a fixed delay.
///
/// Overload failures set `overload` before sleeping so sibling calls and the
/// next batch boundary can see it. Non-retryable errors and the error of the
/// last attempt are returned unchanged.
pub async fn retry_with_backoff<T, E, F, Fut>(
    mut call: F,
    policy: &RetryPolicy,
    overload: Option<&OverloadSignal>,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + std::fmt::Display,
{
    let mut attempt = 0usize;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let kind = e.kind();
                if !policy.is_retryable(kind) || attempt >= policy.max_retries {
                    return Err(e);
                }
                if kind.signals_overload() {
                    if let Some(signal) = overload {
                        signal.set();
                    }
                }
                attempt += 1;
                log::debug!(
                    "retrying after {kind} error (attempt {attempt}/{}): {e}",
                    policy.max_retries
                );
                tokio::time::sleep(policy.retry_delay).await;
            }
        }
    }
}

/// How [`run_in_batches`] partitions and paces its work.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub batch_size: usize,
    /// Sleep before the next batch when the previous one reported overload.
    pub overload_backoff: Duration,
    /// Unconditional pause between batches. Zero disables it.
    pub inter_batch_delay: Duration,
}

impl BatchPlan {
    pub fn new(batch_size: usize, overload_backoff: Duration) -> Self {
        Self {
            batch_size,
            overload_backoff,
            inter_batch_delay: Duration::ZERO,
        }
    }

    pub fn with_inter_batch_delay(mut self, delay: Duration) -> Self {
        self.inter_batch_delay = delay;
        self
    }
}

/// Run `per_item` over `items` in fixed-size batches.
///
/// Items within a batch run concurrently; batches run strictly in sequence.
/// `results[i]` is the outcome of `items[i]`, a failing item never cancels
/// its siblings.
pub async fn run_in_batches<I, T, E, F, Fut>(
    items: Vec<I>,
    per_item: F,
    plan: &BatchPlan,
    overload: &OverloadSignal,
) -> Vec<Result<T, E>>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let batch_size = plan.batch_size.max(1);
    let total = items.len();
    let mut results = Vec::with_capacity(total);
    let mut items = items.into_iter().peekable();
    let mut batch_no = 0usize;

    while items.peek().is_some() {
        if batch_no > 0 {
            // The only place the signal is observed and cleared.
            if overload.take() {
                log::warn!(
                    "overload reported in batch {batch_no}, backing off for {:?}",
                    plan.overload_backoff
                );
                tokio::time::sleep(plan.overload_backoff).await;
            } else if !plan.inter_batch_delay.is_zero() {
                tokio::time::sleep(plan.inter_batch_delay).await;
            }
        }

        let batch: Vec<Fut> = items.by_ref().take(batch_size).map(&per_item).collect();
        batch_no += 1;
        log::debug!(
            "running batch {batch_no} ({} items, {}/{total} done)",
            batch.len(),
            results.len()
        );
        results.extend(join_all(batch).await);
    }

    results
}
