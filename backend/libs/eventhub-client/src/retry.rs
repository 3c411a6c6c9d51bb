//! Generic retry harness
//!
//! Modeled on the workspace's exponential-backoff retry helper, but
//! generalized to accept an unbounded retry count and to observe cooperative
//! cancellation immediately rather than only between attempts.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Number of retries after the first attempt. `-1` means unbounded.
    pub retry: i64,
    /// Fixed delay between attempts.
    pub retry_interval: Duration,
    /// Prefix used in the warning logged before each retry.
    pub retry_message: Option<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry: 5,
            retry_interval: Duration::from_millis(100),
            retry_message: None,
        }
    }
}

impl RetryConfig {
    pub fn unbounded(retry_interval: Duration) -> Self {
        Self {
            retry: -1,
            retry_interval,
            retry_message: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("cancelled")]
    Cancelled,
    #[error("max retries ({0}) exceeded: {1}")]
    MaxRetriesExceeded(i64, E),
}

/// Run `f` until it succeeds, until `retry` failed attempts have been made,
/// or until `cancel` fires — whichever comes first. A fired `cancel` is
/// surfaced immediately, never swallowed into another retry attempt.
pub async fn retry_with<F, Fut, T, E>(
    config: RetryConfig,
    cancel: &CancellationToken,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt: i64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if config.retry >= 0 && attempt > config.retry {
                    return Err(RetryError::MaxRetriesExceeded(config.retry, err));
                }

                warn!(
                    attempt,
                    retry_limit = config.retry,
                    error = %err,
                    "{}",
                    config.retry_message.as_deref().unwrap_or("retrying after failure")
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(config.retry_interval) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = retry_with(RetryConfig::default(), &cancel, move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let config = RetryConfig {
            retry: 5,
            retry_interval: Duration::from_millis(1),
            retry_message: None,
        };

        let result = retry_with(config, &cancel, move || {
            let count = counter_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                if count < 2 {
                    Err("temporary")
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_bounded_retries() {
        let cancel = CancellationToken::new();
        let config = RetryConfig {
            retry: 2,
            retry_interval: Duration::from_millis(1),
            retry_message: None,
        };

        let result = retry_with(config, &cancel, || async { Err::<i32, _>("persistent") }).await;

        assert!(matches!(result, Err(RetryError::MaxRetriesExceeded(2, _))));
    }

    #[tokio::test]
    async fn cancellation_is_observed_instead_of_retried() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = retry_with(RetryConfig::default(), &cancel, || async {
            Err::<i32, _>("should not matter")
        })
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
    }

    #[tokio::test]
    async fn unbounded_retry_keeps_trying() {
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let config = RetryConfig::unbounded(Duration::from_millis(1));

        let result = retry_with(config, &cancel, move || {
            let count = counter_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                if count < 10 {
                    Err("still failing")
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert!(counter.load(Ordering::SeqCst) >= 11);
    }
}
