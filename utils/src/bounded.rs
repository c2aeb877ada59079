use std::future::Future;

use futures::stream::{FuturesUnordered, StreamExt};

/// Drives `tasks` with at most `limit` of them unresolved at any moment and
/// returns their outputs in submission order.
///
/// A task is admitted only once the in-flight set has headroom. When the set
/// is full it is raced and whichever task settles first is removed. After the
/// first failure no further task is admitted; tasks already in flight are
/// drained to completion and the first error is returned.
pub async fn run_bounded<I, F, T, E>(limit: usize, tasks: I) -> Result<Vec<T>, E>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, E>>,
{
    let limit = limit.max(1);
    let mut in_flight = FuturesUnordered::new();
    let mut results: Vec<Option<T>> = Vec::new();
    let mut first_error: Option<E> = None;

    for (index, task) in tasks.into_iter().enumerate() {
        while in_flight.len() >= limit {
            let Some((settled, outcome)) = in_flight.next().await else {
                break;
            };
            record(&mut results, &mut first_error, settled, outcome);
        }
        if first_error.is_some() {
            break;
        }
        results.push(None);
        in_flight.push(async move { (index, task.await) });
    }

    while let Some((settled, outcome)) = in_flight.next().await {
        record(&mut results, &mut first_error, settled, outcome);
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(results.into_iter().flatten().collect()),
    }
}

fn record<T, E>(
    results: &mut [Option<T>],
    first_error: &mut Option<E>,
    index: usize,
    outcome: Result<T, E>,
) {
    match outcome {
        Ok(value) => results[index] = Some(value),
        Err(err) => {
            if first_error.is_none() {
                *first_error = Some(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use anyhow::{anyhow, Result};

    use super::*;

    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    impl Gauge {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                started: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
            })
        }

        async fn track(&self, delay_ms: u64) {
            self.started.fetch_add(1, Ordering::SeqCst);
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_never_exceeds_limit() -> Result<()> {
        for limit in 1..=4 {
            for task_count in [0usize, 1, 3, 9] {
                let gauge = Gauge::new();
                let tasks = (0..task_count).map(|i| {
                    let gauge = gauge.clone();
                    async move {
                        gauge.track((i as u64 * 7) % 5 + 1).await;
                        Ok::<_, anyhow::Error>(i)
                    }
                });

                let results = run_bounded(limit, tasks).await?;

                assert_eq!(results, (0..task_count).collect::<Vec<_>>());
                assert!(gauge.peak.load(Ordering::SeqCst) <= limit);
                assert_eq!(gauge.finished.load(Ordering::SeqCst), task_count);
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_results_follow_submission_order() -> Result<()> {
        let delays = [30u64, 1, 20, 5];
        let tasks = delays.iter().enumerate().map(|(i, delay)| async move {
            tokio::time::sleep(Duration::from_millis(*delay)).await;
            Ok::<_, anyhow::Error>(i * 10)
        });

        let results = run_bounded(4, tasks).await?;

        assert_eq!(results, vec![0, 10, 20, 30]);
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_stops_admission_and_drains_siblings() {
        let gauge = Gauge::new();
        let tasks = (0..6).map(|i| {
            let gauge = gauge.clone();
            async move {
                if i == 1 {
                    gauge.started.fetch_add(1, Ordering::SeqCst);
                    return Err(anyhow!("part {} failed", i));
                }
                gauge.track(20).await;
                Ok(i)
            }
        });

        let err = run_bounded(2, tasks).await.unwrap_err();

        assert_eq!(err.to_string(), "part 1 failed");
        // task 0 was in flight with the failing task and ran to completion
        assert_eq!(gauge.started.load(Ordering::SeqCst), 2);
        assert_eq!(gauge.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_limit_behaves_as_one() -> Result<()> {
        let gauge = Gauge::new();
        let tasks = (0..3).map(|i| {
            let gauge = gauge.clone();
            async move {
                gauge.track(2).await;
                Ok::<_, anyhow::Error>(i)
            }
        });

        run_bounded(0, tasks).await?;

        assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
