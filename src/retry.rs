//! Shared retry primitive for external calls.
//!
//! Every network and subprocess call goes through a `Retrier`: transient
//! failures are retried with a fixed delay ladder, `Permanent`-wrapped errors
//! short-circuit, and cancellation cuts the backoff sleep immediately.

use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Marker wrapper for errors that must never be retried. Attach with
/// [`permanent`]; the retrier unwraps it and returns the inner error.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct Permanent(pub anyhow::Error);

/// Wrap an error so the retrier returns it without further attempts.
pub fn permanent(err: impl Into<anyhow::Error>) -> anyhow::Error {
    anyhow::Error::new(Permanent(err.into()))
}

#[derive(Debug, Clone)]
pub struct Retrier {
    pub max_attempts: usize,
    pub delays: Vec<Duration>,
}

impl Default for Retrier {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(15),
            ],
        }
    }
}

impl Retrier {
    pub fn new(max_attempts: usize, delays: Vec<Duration>) -> Self {
        Self {
            max_attempts,
            delays,
        }
    }

    /// Run `f` up to `max_attempts` times, sleeping between attempts per the
    /// delay sequence (the last delay is reused once exceeded). A
    /// [`Permanent`]-wrapped error returns the inner error immediately.
    /// Cancellation during a backoff sleep returns the last observed error.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_err = None;
        for attempt in 0..attempts {
            if cancel.is_cancelled() {
                return Err(last_err
                    .unwrap_or_else(|| anyhow::Error::new(crate::errors::Cancelled)));
            }
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) => match err.downcast::<Permanent>() {
                    Ok(permanent) => return Err(permanent.0),
                    Err(err) => {
                        tracing::debug!(attempt = attempt + 1, error = %err, "attempt failed");
                        last_err = Some(err);
                    }
                },
            }
            if attempt + 1 < attempts {
                let delay = self.delay_for(attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return Err(last_err.expect("error recorded before sleep"));
                    }
                }
            }
        }
        Err(last_err.expect("at least one attempt runs"))
    }

    fn delay_for(&self, attempt: usize) -> Duration {
        if self.delays.is_empty() {
            return Duration::ZERO;
        }
        self.delays[attempt.min(self.delays.len() - 1)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_retrier(max_attempts: usize) -> Retrier {
        Retrier::new(max_attempts, vec![Duration::from_millis(1)])
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result = fast_retrier(3)
            .run(&CancellationToken::new(), move || {
                let calls = calls2.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        anyhow::bail!("transient")
                    }
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_returns_last_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result: Result<()> = fast_retrier(3)
            .run(&CancellationToken::new(), move || {
                let calls = calls2.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("failure {n}")
                }
            })
            .await;
        assert_eq!(result.unwrap_err().to_string(), "failure 2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result: Result<()> = fast_retrier(3)
            .run(&CancellationToken::new(), move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(permanent(anyhow::anyhow!("bad request")))
                }
            })
            .await;
        // The inner error comes back, unwrapped.
        assert_eq!(result.unwrap_err().to_string(), "bad request");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_cuts_the_backoff_sleep() {
        let cancel = CancellationToken::new();
        let retrier = Retrier::new(3, vec![Duration::from_secs(600)]);
        let cancel2 = cancel.clone();
        let result: Result<()> = retrier
            .run(&cancel, move || {
                let cancel = cancel2.clone();
                async move {
                    // Cancel while the retrier would be sleeping.
                    cancel.cancel();
                    anyhow::bail!("first failure")
                }
            })
            .await;
        assert_eq!(result.unwrap_err().to_string(), "first failure");
    }

    #[tokio::test]
    async fn last_delay_is_reused_beyond_the_ladder() {
        let retrier = Retrier::new(
            5,
            vec![Duration::from_millis(1), Duration::from_millis(2)],
        );
        assert_eq!(retrier.delay_for(0), Duration::from_millis(1));
        assert_eq!(retrier.delay_for(1), Duration::from_millis(2));
        assert_eq!(retrier.delay_for(4), Duration::from_millis(2));
    }
}
