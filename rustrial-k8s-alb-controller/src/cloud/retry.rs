use std::future::Future;

use log::debug;
use tokio::time::{Duration, sleep};

use super::CloudError;
use crate::errors::ControllerError;

/// Bounded exponential backoff.
#[derive(Clone, Debug)]
pub(crate) struct Backoff {
    pub steps: u32,
    pub initial: Duration,
    pub factor: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            steps: 5,
            initial: Duration::from_millis(500),
            factor: 2,
        }
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error or the backoff
/// steps are exhausted, in which case the last error is returned.
pub(crate) async fn with_backoff<T, F, Fut>(
    operation: &str,
    backoff: &Backoff,
    mut f: F,
) -> Result<T, ControllerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ControllerError>>,
{
    let mut delay = backoff.initial;
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < backoff.steps => {
                debug!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    operation, attempt, backoff.steps, delay, e
                );
                sleep(delay).await;
                delay *= backoff.factor;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// [`with_backoff`] with the default backoff.
pub(crate) async fn retry<T, F, Fut>(operation: &str, f: F) -> Result<T, ControllerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ControllerError>>,
{
    with_backoff(operation, &Backoff::default(), f).await
}

/// Transient provider conditions (throttling, a resource in a transitional
/// state) become [`ControllerError::TryAgain`], everything else is passed on.
pub(crate) fn classify(operation: &str, e: CloudError) -> ControllerError {
    if e.is_retryable() {
        ControllerError::TryAgain(format!("{}: {}", operation, e))
    } else {
        ControllerError::Cloud(e)
    }
}

/// [`retry`] for a single cloud call.
pub(crate) async fn retry_call<T, F, Fut>(operation: &str, mut f: F) -> Result<T, ControllerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CloudError>>,
{
    retry(operation, || {
        let call = f();
        async move { call.await.map_err(|e| classify(operation, e)) }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::CloudError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> Backoff {
        Backoff {
            steps: 3,
            initial: Duration::from_millis(1),
            factor: 2,
        }
    }

    #[tokio::test]
    async fn retries_try_again_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let v = with_backoff("op", &fast(), move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ControllerError::TryAgain("not yet".into()))
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(42, v);
        assert_eq!(3, calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn gives_up_after_steps() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let e = with_backoff("op", &fast(), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ControllerError::Cloud(CloudError::Throttled("slow down".into())))
        })
        .await
        .unwrap_err();
        assert!(matches!(e, ControllerError::Cloud(CloudError::Throttled(_))));
        assert_eq!(3, calls.load(Ordering::SeqCst));
    }

    #[test]
    fn transient_cloud_errors_become_try_again() {
        let e = classify("create listener", CloudError::IncorrectStatus("provisioning".into()));
        assert!(matches!(&e, ControllerError::TryAgain(m) if m.starts_with("create listener")));
        assert!(e.is_retryable());
        let e = classify("create listener", CloudError::AlreadyExists("port 80".into()));
        assert!(matches!(e, ControllerError::Cloud(CloudError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let e = with_backoff("op", &fast(), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ControllerError::Cloud(CloudError::NotFound("lb".into())))
        })
        .await
        .unwrap_err();
        assert!(matches!(e, ControllerError::Cloud(CloudError::NotFound(_))));
        assert_eq!(1, calls.load(Ordering::SeqCst));
    }
}
