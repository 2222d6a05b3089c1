//! Turns panics of a reconciliation into [`ControllerError::Panic`].
//!
//! The panic hook runs on the panicking thread before unwinding starts, which
//! is the same worker thread that polls the future wrapped by [`catch`]. So
//! the backtrace is handed over through a thread local.

use std::{
    any::Any,
    backtrace::Backtrace,
    cell::RefCell,
    future::Future,
    panic::{self, AssertUnwindSafe},
    sync::Once,
};

use futures::FutureExt;

use crate::errors::ControllerError;

thread_local! {
    static BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static INSTALL: Once = Once::new();

/// Chain a hook recording the backtrace of every panic in front of the
/// current one. Calling it more than once has no effect.
pub(crate) fn install_hook() {
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let backtrace = Backtrace::force_capture().to_string();
            BACKTRACE.with(|b| *b.borrow_mut() = Some(backtrace));
            previous(info);
        }));
    });
}

fn message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `fut`, a panic while polling it is returned as error.
pub(crate) async fn catch<T, Fut>(fut: Fut) -> Result<T, ControllerError>
where
    Fut: Future<Output = Result<T, ControllerError>>,
{
    BACKTRACE.with(|b| b.borrow_mut().take());
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let backtrace = BACKTRACE
                .with(|b| b.borrow_mut().take())
                .unwrap_or_else(|| "<no backtrace recorded>".to_string());
            Err(ControllerError::Panic {
                message: message(payload.as_ref()),
                backtrace,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn results_pass_through() {
        let r: Result<u32, ControllerError> = catch(async { Ok(7) }).await;
        assert_eq!(7, r.unwrap());
        let r: Result<u32, ControllerError> =
            catch(async { Err(ControllerError::Timeout("lb".into())) }).await;
        assert!(matches!(r, Err(ControllerError::Timeout(_))));
    }

    #[tokio::test]
    async fn panics_become_errors() {
        install_hook();
        let r: Result<(), ControllerError> = catch(async {
            let v: Vec<u32> = vec![];
            if v.is_empty() {
                panic!("boom {}", v.len());
            }
            Ok(())
        })
        .await;
        match r {
            Err(ControllerError::Panic { message, backtrace }) => {
                assert_eq!("boom 0", message);
                assert!(!backtrace.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
