use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use futures::FutureExt;
use gateway_metrics::gateway_stats;
use opentelemetry::KeyValue;
use tokio_util::task::TaskTracker;
use tracing::{error, info_span, Instrument};

/// Fire-and-forget work started while serving requests: mirrors and cache
/// writes. Callers never await it; shutdown does.
#[derive(Clone)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
    failures: Arc<AtomicUsize>,
    metrics: Arc<gateway_stats::Metrics>,
}

impl BackgroundTasks {
    pub fn new(metrics: Arc<gateway_stats::Metrics>) -> Self {
        BackgroundTasks {
            tracker: TaskTracker::new(),
            failures: Arc::default(),
            metrics,
        }
    }

    /// Runs `future` detached. Errors and panics are logged and counted,
    /// never propagated.
    pub fn spawn<F>(&self, task: &'static str, key: &str, future: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let span = info_span!("background", task, key = %key);
        let failures = self.failures.clone();
        let metrics = self.metrics.clone();
        self.tracker.spawn(
            async move {
                let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                    Ok(Ok(())) => return,
                    Ok(Err(err)) => {
                        error!("background {} failed: {:#}", task, err);
                        "error"
                    }
                    Err(_) => {
                        error!("background {} panicked", task);
                        "panic"
                    }
                };
                failures.fetch_add(1, Ordering::SeqCst);
                metrics.background_failures.add(
                    1,
                    &[
                        KeyValue::new("task", task),
                        KeyValue::new("outcome", outcome),
                    ],
                );
            }
            .instrument(span),
        );
    }

    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Tasks that returned an error or panicked since startup.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    /// Stops admitting new work and waits for what is already running.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Waits for every task spawned so far, then keeps accepting work.
    #[cfg(test)]
    pub async fn settle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

#[cfg(test)]
impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new(Arc::new(gateway_stats::Metrics::new()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::{anyhow, Result};

    use super::*;

    #[tokio::test]
    async fn test_shutdown_waits_for_spawned_work() -> Result<()> {
        let tasks = BackgroundTasks::default();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let done = done.clone();
            tasks.spawn("count", "k", async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        tasks.spawn("fail", "k", async { Err(anyhow!("store unavailable")) });

        tasks.shutdown().await;

        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(tasks.pending(), 0);
        assert_eq!(tasks.failures(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_panicking_task_is_contained() -> Result<()> {
        let tasks = BackgroundTasks::default();
        let done = Arc::new(AtomicUsize::new(0));
        tasks.spawn("explode", "k", async { panic!("mirror blew up") });
        let after = done.clone();
        tasks.spawn("count", "k", async move {
            after.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        tasks.settle().await;

        assert_eq!(tasks.failures(), 1);
        assert_eq!(done.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_settle_reopens() -> Result<()> {
        let tasks = BackgroundTasks::default();
        tasks.spawn("noop", "k", async { Ok(()) });
        tasks.settle().await;
        tasks.spawn("noop", "k", async { Ok(()) });
        tasks.settle().await;
        assert_eq!(tasks.pending(), 0);
        assert_eq!(tasks.failures(), 0);
        Ok(())
    }
}
