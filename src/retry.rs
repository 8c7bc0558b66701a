//! Bounded exponential backoff for transient faults
use std::{future::Future, time::Duration};

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{RelayError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries, retry forever when unset
    pub max_retries: Option<u32>,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    fn next_backoff(&self, current: Duration) -> Duration {
        let next = (current.as_millis() as f64 * self.backoff_multiplier) as u64;
        Duration::from_millis(next.min(self.max_backoff_ms))
    }
}

/// Runs `f` until it succeeds, fails with a non-transient error, runs out of
/// retries, or `cancel` fires while backing off.
///
/// On cancellation the last transient error is returned.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    what: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    let mut backoff = Duration::from_millis(config.initial_backoff_ms);

    loop {
        let err: RelayError = match f().await {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => e,
        };
        attempt += 1;
        if config.max_retries.is_some_and(|max| attempt > max) {
            warn!(operation = what, attempts = attempt, error = %err, "retries_exhausted");
            return Err(err);
        }
        warn!(
            operation = what,
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "transient_failure_backing_off"
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(err),
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = config.next_backoff(backoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_retries: Option<u32>) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_retry_success_after_transient_failures() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let result = with_retry(&fast(None), &CancellationToken::new(), "test", move || {
            let count = c.fetch_add(1, Ordering::SeqCst);
            async move {
                if count < 2 {
                    Err(RelayError::SourceUnavailable("down".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let result: Result<()> = with_retry(&fast(None), &CancellationToken::new(), "test", move || {
            c.fetch_add(1, Ordering::SeqCst);
            async {
                Err(RelayError::TargetApplyRejected {
                    table: "t".into(),
                    reason: "schema".into(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(RelayError::TargetApplyRejected { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_max_retries_exceeded() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let result: Result<()> = with_retry(&fast(Some(2)), &CancellationToken::new(), "test", move || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(RelayError::ChannelUnavailable("no quorum".into())) }
        })
        .await;
        assert!(matches!(result, Err(RelayError::ChannelUnavailable(_))));
        // initial + 2 retries
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_backoff_is_capped() {
        let cfg = fast(None);
        let mut b = Duration::from_millis(cfg.initial_backoff_ms);
        for _ in 0..10 {
            b = cfg.next_backoff(b);
        }
        assert_eq!(b, Duration::from_millis(4));
    }

    #[tokio::test]
    async fn test_cancel_stops_retrying() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = with_retry(&fast(None), &cancel, "test", || async {
            Err(RelayError::SourceUnavailable("down".into()))
        })
        .await;
        assert!(matches!(result, Err(RelayError::SourceUnavailable(_))));
    }
}
