//! Exponential-backoff retry for transient failures.
//!
//! Errors are classified rather than caught: an operation's error type
//! implements [`Classify`], and only [`ErrorKind::Transient`] errors spend the
//! retry budget. Everything else surfaces on first occurrence, unchanged.

use std::{future::Future, time::Duration};

use rand::Rng as _;
use serde::{Deserialize, Serialize};

/// How a failed outbound call should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  /// Timeouts, 5xx, connection resets. Retried.
  Transient,
  /// 4xx other than 429, malformed responses. Never retried.
  Permanent,
  /// Provider-side 429. Surfaced immediately so the caller can back off at a
  /// coarser granularity.
  RateLimited,
}

/// Implemented by error types that [`RetryPolicy`] can branch on.
pub trait Classify {
  fn kind(&self) -> ErrorKind;
}

/// Retries an async operation with `base_delay * 2^(attempt-1)` backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  /// Retries after the first call; total calls are at most `retries + 1`.
  pub retries:    u32,
  pub base_delay: Duration,
  /// Relative jitter applied to each delay, e.g. `0.2` for ±20%.
  pub jitter:     f64,
  pub max_delay:  Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      retries:    3,
      base_delay: Duration::from_millis(500),
      jitter:     0.2,
      max_delay:  Duration::from_secs(60),
    }
  }
}

impl RetryPolicy {
  pub fn new(retries: u32, base_delay: Duration) -> Self {
    Self { retries, base_delay, ..Self::default() }
  }

  /// Disable jitter; delays become exact. Mostly useful in tests.
  pub fn without_jitter(mut self) -> Self {
    self.jitter = 0.0;
    self
  }

  /// Backoff before retry number `attempt` (1-based), jitter included.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let base = self
      .base_delay
      .saturating_mul(1u32 << exponent)
      .min(self.max_delay);

    if self.jitter <= 0.0 {
      return base;
    }
    let factor = 1.0 + rand::rng().random_range(-self.jitter..=self.jitter);
    base.mul_f64(factor.max(0.0))
  }

  /// Run `op` until it succeeds, fails non-transiently, or the budget is
  /// spent. `op` receives the 1-based attempt number.
  ///
  /// The last error is returned as-is so callers can still match on it.
  pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
  where
    E: Classify + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
  {
    let mut attempt = 1;
    loop {
      match op(attempt).await {
        Ok(value) => return Ok(value),
        Err(err) if err.kind() == ErrorKind::Transient && attempt <= self.retries => {
          let delay = self.delay_for(attempt);
          tracing::warn!(
            attempt,
            retries = self.retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient failure, retrying"
          );
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(err) => return Err(err),
      }
    }
  }
}
