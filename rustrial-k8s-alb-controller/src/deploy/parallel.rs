use std::future::Future;

use futures::{StreamExt, stream};
use log::warn;
use rand::Rng;
use tokio::time::{Duration, sleep};

use crate::errors::ControllerError;

/// Run `f` for every item with at most `concurrency` calls in flight. Each
/// call is delayed by a random amount of up to `jitter`.
///
/// All calls run to completion, the first error is returned afterwards.
pub(crate) async fn for_each_bounded<T, F, Fut>(
    concurrency: usize,
    jitter: Duration,
    items: Vec<T>,
    f: F,
) -> Result<(), ControllerError>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<(), ControllerError>>,
{
    if items.is_empty() {
        return Ok(());
    }
    let delays: Vec<Duration> = {
        let mut rng = rand::thread_rng();
        let max = jitter.as_millis() as u64;
        items
            .iter()
            .map(|_| {
                if max == 0 {
                    Duration::ZERO
                } else {
                    Duration::from_millis(rng.gen_range(0..=max))
                }
            })
            .collect()
    };
    let calls = items.into_iter().zip(delays).map(|(item, delay)| {
        let call = f(item);
        async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            call.await
        }
    });
    let results: Vec<Result<(), ControllerError>> = stream::iter(calls)
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;
    let mut errors = results.into_iter().filter_map(|r| r.err());
    match errors.next() {
        Some(first) => {
            let more = errors.count();
            if more > 0 {
                warn!("{} more calls of the same batch failed", more);
            }
            Err(first)
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    #[tokio::test]
    async fn runs_all_and_keeps_first_error() {
        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        let result = for_each_bounded(2, Duration::from_millis(2), (0..6).collect(), move |i| {
            let d = d.clone();
            async move {
                d.fetch_add(1, Ordering::SeqCst);
                if i % 2 == 1 {
                    Err(ControllerError::TryAgain(format!("{}", i)))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert_eq!(6, done.load(Ordering::SeqCst));
        assert!(matches!(result, Err(ControllerError::TryAgain(_))));
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (running.clone(), peak.clone());
        for_each_bounded(3, Duration::ZERO, (0..12).collect::<Vec<u32>>(), move |_| {
            let (r, p) = (r.clone(), p.clone());
            async move {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(5)).await;
                r.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= 3 && peak > 0, "{}", peak);
    }
}
