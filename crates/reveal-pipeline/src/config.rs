//! Tunables for the submission and correlation pipeline.

use std::time::Duration;

use serde::Deserialize;

use crate::{
  rate_limit::{RateLimitError, RateLimiter},
  retry::RetryPolicy,
  tracker::RequestTracker,
};

/// Deserialised from the `[pipeline]` table of `config.toml`; every field has
/// a default so the table may be omitted entirely.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
  pub rate_limit_capacity:          u32,
  pub rate_limit_refill_per_second: f64,
  /// Retries after the first call.
  pub retry_max_attempts:           u32,
  pub retry_base_delay_ms:          u64,
  pub request_expiry_timeout_secs:  u64,
  pub resolved_retention_secs:      u64,
  pub submit_batch_size:            u32,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      rate_limit_capacity:          10,
      rate_limit_refill_per_second: 1.0,
      retry_max_attempts:           3,
      retry_base_delay_ms:          500,
      request_expiry_timeout_secs:  900,
      resolved_retention_secs:      3600,
      submit_batch_size:            10,
    }
  }
}

impl PipelineConfig {
  /// Fails on a zero capacity or a refill rate that is not positive.
  pub fn rate_limiter(&self) -> Result<RateLimiter, RateLimitError> {
    RateLimiter::new(self.rate_limit_capacity, self.rate_limit_refill_per_second)
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy::new(
      self.retry_max_attempts,
      Duration::from_millis(self.retry_base_delay_ms),
    )
  }

  pub fn request_tracker(&self) -> RequestTracker {
    RequestTracker::new(
      chrono::Duration::seconds(saturating_secs(self.request_expiry_timeout_secs)),
      chrono::Duration::seconds(saturating_secs(self.resolved_retention_secs)),
    )
  }

  /// Subjects per provider call. A batch never costs more tokens than the
  /// bucket holds.
  pub fn batch_size(&self) -> usize {
    self.submit_batch_size.clamp(1, self.rate_limit_capacity.max(1)) as usize
  }
}

// `chrono::Duration::seconds` panics past `i64::MAX / 1000`.
fn saturating_secs(secs: u64) -> i64 {
  i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000)
}
