//! Bounded exponential-backoff retry for page fetches

use crate::config::RetryConfig;
use crate::error::{FetchError, IngestError, Result};
use backoff::ExponentialBackoffBuilder;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Retries transient failures with exponential backoff, up to a fixed number of
/// attempts. Permanent and protocol failures are returned immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts()
    }

    /// Run `operation` until it succeeds, fails permanently, or runs out of attempts.
    ///
    /// Each attempt is bounded by the per-request timeout; hitting it counts as a
    /// transient failure. A rate-limited response carrying a retry-after hint waits
    /// for that long (capped at the maximum backoff) instead of the computed backoff.
    pub async fn run<F, Fut, T>(&self, label: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, FetchError>>,
    {
        self.run_after(label, || std::future::ready(()), operation).await
    }

    /// Like [`run`](Self::run), but awaits `before` ahead of every attempt.
    ///
    /// Time spent in `before` (waiting for a rate-limit permit) is not part of
    /// the attempt and does not count against the request timeout.
    pub async fn run_after<B, BFut, F, Fut, T>(&self, label: &str, mut before: B, mut operation: F) -> Result<T>
    where
        B: FnMut() -> BFut,
        BFut: Future<Output = ()>,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, FetchError>>,
    {
        let max_attempts = self.max_attempts();
        let request_timeout = self.config.request_timeout();
        let max_backoff = Duration::from_millis(self.config.max_backoff_ms);
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.config.initial_backoff_ms))
            .with_max_interval(max_backoff)
            .with_multiplier(self.config.backoff_multiplier)
            .with_max_elapsed_time(None)
            .build();

        let mut attempt = 0u32;
        let op = || {
            attempt += 1;
            let current = attempt;
            let gate = before();
            let fut = operation();
            async move {
                gate.await;
                let outcome = match timeout(request_timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::Transient(format!(
                        "request timed out after {:?}",
                        request_timeout
                    ))),
                };

                match outcome {
                    Ok(value) => Ok(value),
                    Err(err) if !err.is_retryable() => {
                        Err(backoff::Error::permanent(IngestError::from(err)))
                    }
                    Err(err) if current >= max_attempts => {
                        Err(backoff::Error::permanent(IngestError::RetryExhausted {
                            attempts: current,
                            last_error: err.to_string(),
                        }))
                    }
                    Err(FetchError::RateLimited {
                        retry_after: Some(wait),
                    }) => Err(backoff::Error::retry_after(
                        IngestError::from(FetchError::RateLimited {
                            retry_after: Some(wait),
                        }),
                        wait.min(max_backoff),
                    )),
                    Err(err) => {
                        debug!(attempt = current, error = %err, "attempt failed, will retry");
                        Err(backoff::Error::transient(IngestError::from(err)))
                    }
                }
            }
        };

        backoff::future::retry_notify(policy, op, |err: IngestError, wait: Duration| {
            warn!(
                operation = label,
                error = %err,
                retry_in_ms = wait.as_millis() as u64,
                "transient failure, backing off"
            );
        })
        .await
    }
}
