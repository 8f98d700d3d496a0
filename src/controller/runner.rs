//! Bounded fan-out runner for independent async tasks.
//!
//! The status syncer dispatches N independent computations per cycle. The
//! runner bounds how many run at once and returns results in submission
//! order, so worst-case cycle latency is bounded by the slowest single task
//! and callers can abort on the first error without bookkeeping.

use futures::stream::{self, StreamExt};
use std::future::Future;

/// Default fan-out bound for a single run.
pub const DEFAULT_PARALLELISM: usize = 16;

/// Runs groups of futures with bounded concurrency.
#[derive(Clone, Copy, Debug)]
pub struct GroupRunner {
    parallelism: usize,
}

impl Default for GroupRunner {
    fn default() -> Self {
        Self::new(DEFAULT_PARALLELISM)
    }
}

impl GroupRunner {
    pub fn new(parallelism: usize) -> Self {
        Self {
            parallelism: parallelism.max(1),
        }
    }

    /// Run all tasks with bounded concurrency, collecting every result in
    /// submission order (not completion order).
    pub async fn run_with_result<T, F>(&self, tasks: Vec<F>) -> Vec<F::Output>
    where
        F: Future<Output = T>,
    {
        stream::iter(tasks)
            .buffered(self.parallelism)
            .collect()
            .await
    }

    /// Run all tasks with bounded concurrency, keeping only the first error.
    /// Used by the periodic resync loops where per-task results are logged by
    /// the tasks themselves.
    pub async fn run_all<F, E>(&self, tasks: Vec<F>) -> Result<(), E>
    where
        F: Future<Output = Result<(), E>>,
    {
        let results: Vec<Result<(), E>> = stream::iter(tasks)
            .buffer_unordered(self.parallelism)
            .collect()
            .await;
        results.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_in_submission_order() {
        let runner = GroupRunner::new(4);
        // Later submissions finish first; order must still follow submission.
        let tasks: Vec<_> = (0..4u64)
            .map(|i| async move {
                tokio::time::sleep(Duration::from_millis(40 - i * 10)).await;
                i
            })
            .collect();
        let results = runner.run_with_result(tasks).await;
        assert_eq!(results, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let runner = GroupRunner::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .collect();
        runner.run_with_result(tasks).await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_run_all_surfaces_first_error() {
        let runner = GroupRunner::new(4);
        let tasks: Vec<_> = (0..3)
            .map(|i| async move {
                if i == 1 {
                    Err(format!("task {} failed", i))
                } else {
                    Ok(())
                }
            })
            .collect();
        let result = runner.run_all(tasks).await;
        assert_eq!(result, Err("task 1 failed".to_string()));
    }

    #[tokio::test]
    async fn test_run_all_empty() {
        let runner = GroupRunner::default();
        let tasks: Vec<futures::future::Ready<Result<(), String>>> = Vec::new();
        assert!(runner.run_all(tasks).await.is_ok());
    }
}
