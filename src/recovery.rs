//! Panic recovery for background work.
//!
//! The supervising loop and the build task must never die silently: a panic
//! inside either is captured, logged, and handed back as an error so the
//! owner can reset its status to a safe value.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use crate::types::{Error, Result};

/// Drive `future` to completion, turning a panic at any `.await` point into
/// [`Error::Internal`].
///
/// # Example
/// ```
/// use engine_warden::recovery::with_recovery_async;
///
/// let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
/// let result = rt.block_on(with_recovery_async(async { Ok(7) }, "example"));
/// assert_eq!(result.unwrap(), 7);
/// ```
pub async fn with_recovery_async<Fut, T>(future: Fut, task: &str) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(task, panic = %message, "background task panicked");
            Err(Error::internal(format!("{} panicked: {}", task, message)))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    async fn test_success_passes_through() {
        let result = with_recovery_async(async { Ok(42) }, "build").await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_panic_after_await_is_caught() {
        let result: Result<()> = with_recovery_async(
            async {
                tokio::task::yield_now().await;
                panic!("{}", "late panic");
            },
            "watchdog",
        )
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(err.to_string().contains("watchdog panicked: late panic"));
        assert!(logs_contain("background task panicked"));
    }

    #[tokio::test]
    async fn test_errors_are_not_rewrapped() {
        let result: Result<()> =
            with_recovery_async(async { Err(Error::busy("build running")) }, "build").await;
        assert!(matches!(result, Err(Error::Busy(_))));
    }

    #[test]
    fn test_non_string_payload() {
        let payload: Box<dyn Any + Send> = Box::new(17u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
