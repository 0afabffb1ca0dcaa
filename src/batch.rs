//! # Batch — Bounded-Concurrency Executor
//!
//! Runs a per-item async operation over a list in consecutive slices of at
//! most `batch_size`, awaiting every item in a slice concurrently and pausing
//! `delay` between slices. The pause throttles pressure on whatever shared
//! resource the operation hits (typically the connection pool or an external
//! API); it is backpressure, not a correctness requirement.
//!
//! One item failing never aborts its siblings: failures are logged, counted
//! into [`BatchOutcome`], and otherwise swallowed here. The caller decides
//! whether an aggregate failure count is fatal for the job.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Counts accumulated over one executor run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub successes: u64,
    pub failures: u64,
}

impl BatchOutcome {
    pub fn total(&self) -> u64 {
        self.successes + self.failures
    }
}

#[derive(Clone, Debug)]
pub struct BatchRunner {
    batch_size: usize,
    delay: Duration,
}

impl BatchRunner {
    /// A batch size of 0 is treated as 1.
    pub fn new(batch_size: usize, delay: Duration) -> Self {
        BatchRunner {
            batch_size: batch_size.max(1),
            delay,
        }
    }

    /// Process every item, slice by slice. See [`run_with_progress`] for the
    /// variant that reports between slices.
    ///
    /// [`run_with_progress`]: BatchRunner::run_with_progress
    pub async fn run<T, F, Fut>(&self, items: Vec<T>, op: F) -> BatchOutcome
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        self.run_with_progress(items, op, |_, _| {}).await
    }

    /// Process every item, invoking `progress(processed_so_far, total)` after
    /// each slice completes.
    pub async fn run_with_progress<T, F, Fut, P>(
        &self,
        items: Vec<T>,
        mut op: F,
        mut progress: P,
    ) -> BatchOutcome
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
        P: FnMut(usize, usize),
    {
        let total = items.len();
        let mut outcome = BatchOutcome::default();
        let mut processed = 0usize;

        let mut remaining = items.into_iter().peekable();
        while remaining.peek().is_some() {
            let slice: Vec<T> = remaining.by_ref().take(self.batch_size).collect();
            let slice_start = processed;
            let futures: Vec<Fut> = slice.into_iter().map(&mut op).collect();
            let results = futures::future::join_all(futures).await;

            for (offset, result) in results.into_iter().enumerate() {
                match result {
                    Ok(()) => outcome.successes += 1,
                    Err(e) => {
                        outcome.failures += 1;
                        warn!(item = slice_start + offset, error = %e, "batch item failed");
                    }
                }
                processed += 1;
            }
            progress(processed, total);

            if remaining.peek().is_some() && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }
        outcome
    }
}
