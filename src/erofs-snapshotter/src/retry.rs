//! Bounded exponential backoff for operations that fail transiently.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SnapshotterError};

/// Controls retry behaviour.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the initial one. Must be >= 1.
    pub max_attempts: u32,
    /// Wait before the first retry.
    pub initial_wait: Duration,
    /// Cap on the wait between retries.
    pub max_wait: Duration,
    /// Applied to the wait after each retry. Must be >= 1.0.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            initial_wait: Duration::from_millis(100),
            max_wait: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

/// Executes `op` until it succeeds or `cfg.max_attempts` is reached, sleeping
/// with exponential backoff between attempts.
///
/// Cancellation interrupts the backoff sleep and returns
/// [`SnapshotterError::Cancelled`] immediately; an already-cancelled token
/// returns it on the first wait without sleeping. When all attempts fail the
/// last error is wrapped in [`SnapshotterError::RetryExhausted`] with the
/// attempt count. Sleep futures are dropped on every exit path, so no timer
/// outlives the call.
pub async fn retry_with_result<T, F, Fut>(
    token: &CancellationToken,
    cfg: &RetryConfig,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if cfg.max_attempts < 1 {
        return Err(SnapshotterError::InvalidState(format!(
            "invalid retry config: max_attempts must be >= 1, got {}",
            cfg.max_attempts
        )));
    }

    let mut wait = cfg.initial_wait;
    let mut last_err = None;

    for attempt in 1..=cfg.max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => last_err = Some(err),
        }

        if attempt == cfg.max_attempts {
            break;
        }

        tokio::select! {
            _ = token.cancelled() => return Err(SnapshotterError::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }

        wait = Duration::from_secs_f64((wait.as_secs_f64() * cfg.multiplier).max(0.0));
        if wait > cfg.max_wait {
            wait = cfg.max_wait;
        }
    }

    Err(SnapshotterError::RetryExhausted {
        attempts: cfg.max_attempts,
        source: Box::new(last_err.expect("at least one attempt ran")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_wait: Duration::from_millis(1),
            max_wait: Duration::from_millis(10),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result = retry_with_result(&token, &RetryConfig::default(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Ok(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result = retry_with_result(&token, &fast_config(5), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n >= 3 {
                    Ok("ok")
                } else {
                    Err(SnapshotterError::InvalidState("transient".into()))
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fails_after_max_attempts_with_wrapped_cause() {
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let result: Result<()> = retry_with_result(&token, &fast_config(3), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(SnapshotterError::LayerBlobNotFound {
                    snapshot_id: "retry-test".into(),
                    dir: "/tmp".into(),
                    searched: vec![],
                })
            }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("3 attempts"));
        assert!(err.is_layer_blob_not_found());
    }

    #[tokio::test]
    async fn zero_attempts_rejected_without_calling_op() {
        let token = CancellationToken::new();
        let called = AtomicU32::new(0);

        let result: Result<()> = retry_with_result(&token, &fast_config(0), || {
            called.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);

        let cfg = RetryConfig {
            max_attempts: 10,
            initial_wait: Duration::from_secs(30),
            max_wait: Duration::from_secs(60),
            multiplier: 2.0,
        };

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result: Result<()> = retry_with_result(&token, &cfg, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(SnapshotterError::InvalidState("keep trying".into())) }
        })
        .await;

        assert!(matches!(result, Err(SnapshotterError::Cancelled)));
        assert!(attempts.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn already_cancelled_token_returns_on_first_wait() {
        let token = CancellationToken::new();
        token.cancel();
        let attempts = AtomicU32::new(0);

        let start = std::time::Instant::now();
        let result: Result<()> = retry_with_result(
            &token,
            &RetryConfig {
                max_attempts: 5,
                initial_wait: Duration::from_secs(10),
                max_wait: Duration::from_secs(10),
                multiplier: 1.0,
            },
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(SnapshotterError::InvalidState("nope".into())) }
            },
        )
        .await;

        assert!(matches!(result, Err(SnapshotterError::Cancelled)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn backoff_is_capped() {
        // With an aggressive multiplier the total elapsed time stays bounded
        // by max_wait per gap; mostly this asserts the loop terminates fast.
        let token = CancellationToken::new();
        let start = std::time::Instant::now();

        let _: Result<()> = retry_with_result(
            &token,
            &RetryConfig {
                max_attempts: 6,
                initial_wait: Duration::from_millis(1),
                max_wait: Duration::from_millis(5),
                multiplier: 10.0,
            },
            || async { Err(SnapshotterError::InvalidState("fail".into())) },
        )
        .await;

        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
