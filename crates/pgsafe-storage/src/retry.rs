//! Exponential backoff with jitter around remote calls.
//!
//! The delay before retry `k` (0-based) is `min(max_delay, base_delay * 2^k)`
//! scaled by a uniform factor in `[0.75, 1.25]`. `max_attempts` counts every
//! attempt, including the first.

use std::future::Future;
use std::time::Duration;

use opendal::ErrorKind;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{TransferError, TransferResult};

/// Fraction of the nominal delay that jitter may add or remove
pub const JITTER_FRACTION: f64 = 0.25;

/// Whether a store error is worth another attempt.
///
/// Classification is structural: OpenDAL marks throttling, 5xx responses and
/// connection failures as temporary, and reports 429 as `RateLimited`.
/// Everything else (auth, not-found, bad request) is terminal.
pub fn is_retryable(err: &opendal::Error) -> bool {
    err.is_temporary() || err.kind() == ErrorKind::RateLimited
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &pgsafe_core::config::RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: cfg.base_delay(),
            max_delay: cfg.max_delay(),
        }
    }

    /// Nominal delay before retry `retry` (0-based), without jitter.
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        let factor = 2f64.powi(retry.min(62) as i32);
        let nominal = self.base_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(nominal.min(self.max_delay.as_secs_f64()))
    }

    /// Delay before retry `retry` with jitter `unit` in `[-1.0, 1.0]`.
    pub fn delay_with_jitter(&self, retry: u32, unit: f64) -> Duration {
        let unit = unit.clamp(-1.0, 1.0);
        let scaled = self.nominal_delay(retry).as_secs_f64() * (1.0 + JITTER_FRACTION * unit);
        Duration::from_secs_f64(scaled.max(0.0))
    }

    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let unit = rand::thread_rng().gen_range(-1.0..=1.0);
        self.delay_with_jitter(retry, unit)
    }

    /// Run `attempt` until it succeeds, fails terminally, exhausts the
    /// attempt budget, or `cancel` fires. Cancellation is observed both while
    /// an attempt is in flight and while waiting out a backoff delay.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> TransferResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = opendal::Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(TransferError::cancelled(operation));
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::cancelled(operation)),
                r = attempt() => r,
            };
            attempts += 1;

            let err = match result {
                Ok(value) => {
                    if attempts > 1 {
                        info!(operation, attempts, "succeeded after retries");
                    } else {
                        debug!(operation, "succeeded");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !is_retryable(&err) {
                warn!(operation, error = %err, "non-retryable error");
                return Err(TransferError::Terminal {
                    operation: operation.to_string(),
                    source: err,
                });
            }

            if attempts >= max_attempts {
                error!(operation, attempts, error = %err, "retry budget exhausted");
                return Err(TransferError::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts,
                    source: err,
                });
            }

            let delay = self.backoff_delay(attempts - 1);
            warn!(
                operation,
                attempt = attempts,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retryable error, backing off"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::cancelled(operation)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
