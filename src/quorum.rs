//! Fan-out primitives used to talk to every node at once.

use crate::error::{Error, MultiError};
use futures::future::join_all;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

/// Runs `op` on every item concurrently and resolves with the first `n`
/// successes, in completion order. Fails as soon as `len - n + 1` operations
/// have failed. Operations still in flight are left running as detached tasks.
pub async fn race_to_first_n<I, T, F, Fut>(
    items: I,
    n: usize,
    mut op: F,
) -> Result<Vec<T>, MultiError>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = Result<T, Error>> + Send + 'static,
    T: Send + 'static,
{
    if n == 0 {
        return Ok(Vec::new());
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut total = 0;
    for item in items {
        let fut = op(item);
        let tx = tx.clone();
        tokio::spawn(async move {
            // Receiver is gone once the caller has its answer.
            let _ = tx.send(fut.await);
        });
        total += 1;
    }

    drop(tx);

    let first_n = n.min(total);
    if first_n == 0 {
        return Ok(Vec::new());
    }

    let reject_threshold = total - first_n + 1;
    let mut results = Vec::with_capacity(first_n);
    let mut errors = Vec::new();

    while let Some(outcome) = rx.recv().await {
        match outcome {
            Ok(v) => {
                results.push(v);
                if results.len() == first_n {
                    return Ok(results);
                }
            }
            Err(e) => {
                errors.push(e);
                if errors.len() == reject_threshold {
                    return Err(MultiError::new(errors));
                }
            }
        }
    }

    // Only reachable when a task panicked before reporting.
    Err(MultiError::new(errors))
}

/// Runs `op` once per item with at most `concurrency` calls in flight.
/// Failures are collected and returned after the whole sweep.
pub async fn bounded_for_each<T, F, Fut>(
    items: &[T],
    concurrency: usize,
    op: F,
) -> Result<(), MultiError>
where
    F: Fn(&T) -> Fut,
    Fut: Future<Output = Result<(), Error>>,
{
    let cursor = AtomicUsize::new(0);
    let errors = Mutex::new(Vec::new());
    let workers = concurrency.max(1).min(items.len());

    let (cursor, errors, op) = (&cursor, &errors, &op);
    join_all((0..workers).map(move |_| async move {
        loop {
            let index = cursor.fetch_add(1, Ordering::Relaxed);
            let Some(item) = items.get(index) else {
                break;
            };

            if let Err(e) = op(item).await {
                errors.lock().unwrap_or_else(|p| p.into_inner()).push(e);
            }
        }
    }))
    .await;

    let errors = std::mem::take(&mut *errors.lock().unwrap_or_else(|p| p.into_inner()));
    if errors.is_empty() {
        Ok(())
    } else {
        Err(MultiError::new(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Clone, Copy, Debug)]
    enum Step {
        Ok(u32),
        Fail,
        Never,
        After(u64, u32),
    }

    async fn run(step: Step) -> Result<u32, Error> {
        match step {
            Step::Ok(v) => Ok(v),
            Step::Fail => Err(Error::Rejected("failed".into())),
            Step::Never => std::future::pending().await,
            Step::After(ms, v) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(v)
            }
        }
    }

    #[tokio::test]
    async fn resolves_without_waiting_on_stragglers() {
        let steps = [Step::Ok(1), Step::Ok(2), Step::Never];
        let mut got = tokio::time::timeout(
            Duration::from_secs(5),
            race_to_first_n(steps, 2, |s| run(s)),
        )
        .await
        .unwrap()
        .unwrap();

        got.sort();
        assert_eq!(got, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn results_come_back_in_completion_order() {
        let steps = [Step::After(30, 1), Step::After(10, 2), Step::After(20, 3)];
        let got = race_to_first_n(steps, 2, |s| run(s)).await.unwrap();
        assert_eq!(got, vec![2, 3]);
    }

    #[tokio::test]
    async fn rejects_once_success_is_unreachable() {
        let steps = [Step::Fail, Step::Never, Step::Fail];
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            race_to_first_n(steps, 2, |s| run(s)),
        )
        .await
        .unwrap()
        .unwrap_err();

        assert_eq!(err.errors.len(), 2);
        assert_eq!(err.message, "Failed due to multiple errors");
    }

    #[tokio::test]
    async fn one_failure_is_tolerated_with_quorum() {
        let steps = [Step::Fail, Step::Ok(7), Step::Ok(8)];
        let got = race_to_first_n(steps, 2, |s| run(s)).await.unwrap();
        assert_eq!(got.len(), 2);
    }

    #[tokio::test]
    async fn all_required_fails_on_first_error() {
        let steps = [Step::Ok(1), Step::Fail, Step::Never];
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            race_to_first_n(steps, 3, |s| run(s)),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert_eq!(err.errors.len(), 1);
        assert_eq!(err.message, "Failed due to error");
    }

    #[tokio::test]
    async fn zero_needed_runs_nothing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let got = race_to_first_n([1, 2, 3], 0, move |_| {
            c.fetch_add(1, Ordering::Relaxed);
            async { Ok::<_, Error>(()) }
        })
        .await
        .unwrap();
        assert!(got.is_empty());
        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn n_above_len_is_clamped() {
        let got = race_to_first_n([Step::Ok(1), Step::Ok(2)], 5, |s| run(s))
            .await
            .unwrap();
        assert_eq!(got.len(), 2);
    }

    #[tokio::test]
    async fn sweep_visits_each_item_once_within_bound() {
        let items: Vec<usize> = (0..10).collect();
        let seen = Mutex::new(Vec::new());
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        bounded_for_each(&items, 3, |i| {
            let (seen, in_flight, peak) = (&seen, &in_flight, &peak);
            let i = *i;
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                seen.lock().unwrap().push(i);
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        assert_eq!(seen, items);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn sweep_keeps_going_after_failures() {
        let items = [1, 2, 3, 4];
        let visited = AtomicUsize::new(0);
        let err = bounded_for_each(&items, items.len(), |i| {
            let visited = &visited;
            let odd = *i % 2 == 1;
            async move {
                visited.fetch_add(1, Ordering::SeqCst);
                if odd {
                    Err(Error::Rejected("odd".into()))
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap_err();

        assert_eq!(visited.load(Ordering::SeqCst), 4);
        assert_eq!(err.errors.len(), 2);
    }

    #[tokio::test]
    async fn sweep_over_nothing() {
        let items: [u8; 0] = [];
        bounded_for_each(&items, 4, |_| async { Ok(()) }).await.unwrap();
    }
}
