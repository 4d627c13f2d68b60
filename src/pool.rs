//! Bounded concurrency pool
//!
//! Runs one async task per input item with at most `limit` tasks in flight.
//! The first failing task stops the pool from starting further items; tasks
//! that were already started are allowed to finish before the error is
//! returned. On success the results line up with the input order.

use std::future::Future;

use tokio::task::JoinSet;
use tracing::debug;

/// Run `task` over `items` with at most `limit` concurrent tasks.
///
/// `limit` values below 1 are treated as 1. Partial results are discarded
/// when any task fails. A panicking task re-raises its panic in the caller.
pub async fn run<T, R, E, F, Fut>(items: Vec<T>, limit: usize, mut task: F) -> Result<Vec<R>, E>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    let limit = limit.max(1);
    let total = items.len();
    let mut results: Vec<Option<R>> = (0..total).map(|_| None).collect();
    let mut pending = items.into_iter().enumerate();
    let mut in_flight = JoinSet::new();
    let mut failure: Option<E> = None;

    loop {
        while failure.is_none() && in_flight.len() < limit {
            let Some((index, item)) = pending.next() else {
                break;
            };
            let fut = task(item);
            in_flight.spawn(async move { (index, fut.await) });
        }

        let Some(joined) = in_flight.join_next().await else {
            break;
        };

        match joined {
            Ok((index, Ok(value))) => results[index] = Some(value),
            Ok((index, Err(err))) => {
                if failure.is_none() {
                    debug!(index, total, "Pool task failed, draining in-flight tasks");
                    failure = Some(err);
                }
            }
            Err(join_err) => {
                if join_err.is_panic() {
                    std::panic::resume_unwind(join_err.into_panic());
                }
                // Cancellation only happens when the runtime shuts down.
                debug!(error = %join_err, "Pool task cancelled");
            }
        }
    }

    if let Some(err) = failure {
        return Err(err);
    }

    Ok(results.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_follow_input_order() {
        // Later items finish first
        let items: Vec<u64> = (0..8).collect();
        let results = run(items, 4, |i| async move {
            tokio::time::sleep(Duration::from_millis(40 - i * 5)).await;
            Ok::<_, String>(i * 10)
        })
        .await
        .unwrap();

        assert_eq!(results, vec![0, 10, 20, 30, 40, 50, 60, 70]);
    }

    #[tokio::test]
    async fn test_never_exceeds_limit() {
        for limit in [1usize, 2, 3, 7] {
            let active = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));

            let items: Vec<usize> = (0..25).collect();
            let results = run(items, limit, |i| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    assert!(now <= limit, "{now} tasks active with limit {limit}");
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(i)
                }
            })
            .await
            .unwrap();

            assert_eq!(results.len(), 25);
            assert!(peak.load(Ordering::SeqCst) <= limit);
        }
    }

    #[tokio::test]
    async fn test_zero_limit_runs_sequentially() {
        let active = Arc::new(AtomicUsize::new(0));
        let results = run(vec![1, 2, 3], 0, |i| {
            let active = active.clone();
            async move {
                assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                tokio::task::yield_now().await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, String>(i)
            }
        })
        .await
        .unwrap();

        assert_eq!(results, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_fail_fast_stops_new_items_and_drains_started() {
        let started = Arc::new(AtomicUsize::new(0));
        let slow_finished = Arc::new(AtomicBool::new(false));

        let items: Vec<usize> = (0..6).collect();
        let result = run(items, 2, |i| {
            let started = started.clone();
            let slow_finished = slow_finished.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                match i {
                    0 => Err(format!("item {i} failed")),
                    1 => {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        slow_finished.store(true, Ordering::SeqCst);
                        Ok(i)
                    }
                    _ => Ok(i),
                }
            }
        })
        .await;

        assert_eq!(result.unwrap_err(), "item 0 failed");
        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert!(slow_finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_empty_input() {
        let results = run(Vec::<u8>::new(), 3, |i| async move { Ok::<_, String>(i) })
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}
