//! Async token bucket shared by every outbound submission path.
//!
//! The bucket itself is a [`governor`] GCRA limiter with burst `C` and one
//! cell replenished every `1/R` seconds. It reads time from the tokio clock,
//! so refill is computed lazily from the same clock the waiters sleep on.
//!
//! Waiters queue on a fair [`tokio::sync::Mutex`], which hands out the lock in
//! FIFO order. Only the head of the queue holds the turn and checks the
//! bucket; governor deducts cells only when all `n` conform. A waiter that is
//! dropped (timeout, cancellation) releases its turn without touching the
//! bucket, so the next waiter proceeds immediately.

use std::{
  num::NonZeroU32,
  sync::{Mutex, MutexGuard},
  time::Duration,
};

use governor::{
  InsufficientCapacity, Quota,
  clock::Clock,
  middleware::NoOpMiddleware,
  state::{InMemoryState, NotKeyed},
};
use thiserror::Error;
use tokio::time::Instant;

/// Floor for the calibrated rate, as a fraction of the configured rate.
const MIN_RATE_FRACTION: f64 = 0.1;

/// Share of the configured rate restored by each [`RateLimiter::recover`].
const RECOVERY_STEP: f64 = 0.1;

#[derive(Debug, Error, PartialEq)]
pub enum RateLimitError {
  /// More tokens than the bucket can ever hold.
  #[error("requested {requested} tokens but capacity is {capacity}")]
  InvalidRequest { requested: u32, capacity: u32 },

  #[error("deadline elapsed while waiting for rate-limit tokens")]
  DeadlineElapsed,

  #[error("rate limit capacity must be at least 1")]
  ZeroCapacity,

  #[error("refill rate must be a positive number of tokens per second, got {0}")]
  InvalidRate(f64),
}

// ─── Clock ───────────────────────────────────────────────────────────────────

/// governor clock backed by [`tokio::time::Instant`], so the bucket follows a
/// paused or advanced tokio clock.
#[derive(Debug, Clone, Copy, Default)]
struct TokioClock;

impl Clock for TokioClock {
  type Instant = std::time::Instant;

  fn now(&self) -> Self::Instant { Instant::now().into_std() }
}

type Gcra =
  governor::RateLimiter<NotKeyed, InMemoryState, TokioClock, NoOpMiddleware<std::time::Instant>>;

fn build(capacity: NonZeroU32, rate: f64) -> Result<Gcra, RateLimitError> {
  let invalid = || RateLimitError::InvalidRate(rate);
  if !rate.is_finite() || rate <= 0.0 {
    return Err(invalid());
  }
  let period = Duration::try_from_secs_f64(1.0 / rate).map_err(|_| invalid())?;
  let quota = Quota::with_period(period).ok_or_else(invalid)?.allow_burst(capacity);
  Ok(governor::RateLimiter::direct_with_clock(quota, TokioClock))
}

/// A limiter at `rate` whose burst has just been spent.
fn build_drained(capacity: NonZeroU32, rate: f64) -> Result<Gcra, RateLimitError> {
  let gcra = build(capacity, rate)?;
  // A fresh limiter always admits its full burst.
  let _ = gcra.check_n(capacity);
  Ok(gcra)
}

#[derive(Debug)]
struct Bucket {
  gcra:         Gcra,
  /// Current, possibly throttled, refill rate in tokens per second.
  rate:         f64,
  /// No refill happens before this instant (provider `Retry-After`).
  paused_until: Option<Instant>,
}

// ─── RateLimiter ─────────────────────────────────────────────────────────────

/// Token bucket with capacity `C` refilled at `R` tokens per second.
#[derive(Debug)]
pub struct RateLimiter {
  capacity:        NonZeroU32,
  configured_rate: f64,
  bucket:          Mutex<Bucket>,
  /// FIFO turnstile; the holder is the only caller allowed to wait on tokens.
  queue:           tokio::sync::Mutex<()>,
}

impl RateLimiter {
  /// A full bucket.
  pub fn new(capacity: u32, refill_per_second: f64) -> Result<Self, RateLimitError> {
    let capacity = NonZeroU32::new(capacity).ok_or(RateLimitError::ZeroCapacity)?;
    let gcra = build(capacity, refill_per_second)?;
    Ok(Self {
      capacity,
      configured_rate: refill_per_second,
      bucket: Mutex::new(Bucket {
        gcra,
        rate: refill_per_second,
        paused_until: None,
      }),
      queue: tokio::sync::Mutex::new(()),
    })
  }

  pub fn capacity(&self) -> u32 { self.capacity.get() }

  /// The refill rate currently in effect, after any calibration.
  pub fn current_rate(&self) -> f64 { self.lock_bucket().rate }

  /// Wait until `n` tokens are available, then deduct them atomically.
  pub async fn acquire(&self, n: u32) -> Result<(), RateLimitError> {
    self.acquire_until(n, None).await
  }

  /// [`acquire`](Self::acquire) with an optional deadline. On expiry no tokens
  /// are consumed and the queue position is released.
  pub async fn acquire_until(
    &self,
    n:        u32,
    deadline: Option<Instant>,
  ) -> Result<(), RateLimitError> {
    // Fails before queueing: no amount of waiting helps.
    if n > self.capacity.get() {
      return Err(RateLimitError::InvalidRequest {
        requested: n,
        capacity:  self.capacity.get(),
      });
    }
    let Some(n) = NonZeroU32::new(n) else {
      return Ok(());
    };

    match deadline {
      Some(at) => tokio::time::timeout_at(at, self.wait_and_take(n))
        .await
        .map_err(|_| RateLimitError::DeadlineElapsed)?,
      None => self.wait_and_take(n).await,
    }
  }

  async fn wait_and_take(&self, n: NonZeroU32) -> Result<(), RateLimitError> {
    let _turn = self.queue.lock().await;

    loop {
      let wait = {
        let mut bucket = self.lock_bucket();
        let now = Instant::now();
        match bucket.paused_until {
          Some(until) if now < until => until - now,
          paused => {
            if paused.is_some() {
              // Refill starts when the pause ends, not when it began.
              bucket.gcra = build_drained(self.capacity, bucket.rate)?;
              bucket.paused_until = None;
            }
            match bucket.gcra.check_n(n) {
              Ok(Ok(())) => return Ok(()),
              Ok(Err(not_until)) => not_until.wait_time_from(now.into_std()),
              Err(InsufficientCapacity(capacity)) => {
                return Err(RateLimitError::InvalidRequest { requested: n.get(), capacity });
              }
            }
          }
        }
      };
      tokio::time::sleep(wait.max(Duration::from_micros(1))).await;
    }
  }

  /// React to a provider-side 429: halve the effective rate, empty the
  /// bucket, and hold refill until `retry_after` has passed.
  pub fn throttle(&self, retry_after: Option<Duration>) {
    let mut bucket = self.lock_bucket();
    let floor = self.configured_rate * MIN_RATE_FRACTION;
    let rate = (bucket.rate / 2.0).max(floor);

    match build_drained(self.capacity, rate) {
      Ok(gcra) => {
        bucket.gcra = gcra;
        bucket.rate = rate;
      }
      Err(err) => tracing::warn!(%err, "could not lower submission rate"),
    }
    if let Some(delay) = retry_after {
      let until = Instant::now() + delay;
      bucket.paused_until = Some(bucket.paused_until.map_or(until, |p| p.max(until)));
    }

    tracing::warn!(
      rate = bucket.rate,
      retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
      "provider rate limit hit; throttling submissions"
    );
  }

  /// Step the effective rate back toward the configured rate.
  ///
  /// The limiter at the new rate starts empty, so a recovery step never
  /// releases a burst on its own.
  pub fn recover(&self) {
    let mut bucket = self.lock_bucket();
    if bucket.rate >= self.configured_rate {
      return;
    }
    let rate = (bucket.rate + self.configured_rate * RECOVERY_STEP).min(self.configured_rate);
    match build_drained(self.capacity, rate) {
      Ok(gcra) => {
        bucket.gcra = gcra;
        bucket.rate = rate;
        tracing::debug!(rate, "submission rate recovering");
      }
      Err(err) => tracing::warn!(%err, "could not raise submission rate"),
    }
  }

  fn lock_bucket(&self) -> MutexGuard<'_, Bucket> {
    // Every write replaces whole fields; a poisoned lock still has valid state.
    self.bucket.lock().unwrap_or_else(|e| e.into_inner())
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::*;

  fn limiter(capacity: u32, rate: f64) -> RateLimiter {
    RateLimiter::new(capacity, rate).unwrap()
  }

  #[test]
  fn bad_parameters_are_rejected() {
    assert_eq!(RateLimiter::new(0, 1.0).unwrap_err(), RateLimitError::ZeroCapacity);
    for rate in [0.0, -1.0, f64::NAN, f64::INFINITY] {
      assert!(matches!(
        RateLimiter::new(1, rate),
        Err(RateLimitError::InvalidRate(_))
      ));
    }
  }

  #[tokio::test(start_paused = true)]
  async fn full_bucket_serves_capacity_immediately() {
    let limiter = limiter(5, 1.0);
    let start = Instant::now();
    limiter.acquire(5).await.unwrap();
    assert_eq!(start.elapsed(), Duration::ZERO);
  }

  #[tokio::test(start_paused = true)]
  async fn drained_bucket_waits_one_refill_interval() {
    let limiter = limiter(4, 2.0);
    let start = Instant::now();
    limiter.acquire(4).await.unwrap();
    limiter.acquire(1).await.unwrap();
    assert!(
      start.elapsed() >= Duration::from_millis(500),
      "completed after {:?}",
      start.elapsed()
    );
  }

  #[tokio::test(start_paused = true)]
  async fn over_capacity_fails_immediately() {
    let limiter = limiter(3, 1.0);
    assert_eq!(
      limiter.acquire(4).await,
      Err(RateLimitError::InvalidRequest { requested: 4, capacity: 3 })
    );

    tokio::time::advance(Duration::from_secs(3600)).await;
    assert!(matches!(
      limiter.acquire(4).await,
      Err(RateLimitError::InvalidRequest { .. })
    ));
  }

  #[tokio::test(start_paused = true)]
  async fn refill_never_exceeds_capacity() {
    let limiter = limiter(2, 10.0);
    tokio::time::advance(Duration::from_secs(60)).await;

    let start = Instant::now();
    limiter.acquire(2).await.unwrap();
    assert_eq!(start.elapsed(), Duration::ZERO);
    limiter.acquire(1).await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(100));
  }

  #[tokio::test(start_paused = true)]
  async fn cancelled_waiter_does_not_consume_or_block() {
    let limiter = Arc::new(limiter(1, 1.0));
    limiter.acquire(1).await.unwrap();

    // Second waiter gives up before the refill.
    let cancelled = tokio::time::timeout(
      Duration::from_millis(200),
      limiter.acquire(1),
    )
    .await;
    assert!(cancelled.is_err());

    tokio::time::sleep(Duration::from_secs(1)).await;
    let third = tokio::time::timeout(Duration::from_secs(2), limiter.acquire(1)).await;
    assert!(third.is_ok(), "third waiter stuck after cancellation");
  }

  #[tokio::test(start_paused = true)]
  async fn deadline_elapsed_consumes_nothing() {
    let limiter = limiter(2, 1.0);
    let start = Instant::now();
    limiter.acquire(2).await.unwrap();

    let deadline = start + Duration::from_millis(100);
    assert_eq!(
      limiter.acquire_until(2, Some(deadline)).await,
      Err(RateLimitError::DeadlineElapsed)
    );

    // Both tokens are back exactly two refill intervals after the drain.
    tokio::time::sleep_until(start + Duration::from_secs(2)).await;
    let resumed = Instant::now();
    limiter.acquire(2).await.unwrap();
    assert_eq!(resumed.elapsed(), Duration::ZERO);
  }

  #[tokio::test(start_paused = true)]
  async fn waiters_are_served_in_fifo_order() {
    let limiter = Arc::new(limiter(2, 1.0));
    limiter.acquire(2).await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for (i, n) in [2u32, 1, 1].into_iter().enumerate() {
      let limiter = limiter.clone();
      let order = order.clone();
      handles.push(tokio::spawn(async move {
        limiter.acquire(n).await.unwrap();
        order.lock().unwrap().push(i);
      }));
      // Make sure each task is queued before the next one starts.
      tokio::task::yield_now().await;
    }
    for handle in handles {
      handle.await.unwrap();
    }

    // The large request at the head is not starved by the cheap ones behind it.
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
  }

  #[tokio::test(start_paused = true)]
  async fn throttle_halves_rate_and_recover_restores_it() {
    let limiter = limiter(10, 4.0);
    limiter.throttle(None);
    assert!((limiter.current_rate() - 2.0).abs() < 1e-9);

    // Drained, and refilling at the halved rate.
    let start = Instant::now();
    limiter.acquire(1).await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(500));

    for _ in 0..20 {
      limiter.recover();
    }
    assert!((limiter.current_rate() - 4.0).abs() < 1e-9);
  }

  #[tokio::test(start_paused = true)]
  async fn throttle_respects_retry_after() {
    let limiter = limiter(1, 10.0);
    limiter.throttle(Some(Duration::from_secs(5)));

    let start = Instant::now();
    limiter.acquire(1).await.unwrap();
    assert!(start.elapsed() >= Duration::from_secs(5));
  }

  #[tokio::test(start_paused = true)]
  async fn throttled_rate_has_a_floor() {
    let limiter = limiter(1, 1.0);
    for _ in 0..10 {
      limiter.throttle(None);
    }
    assert!((limiter.current_rate() - 0.1).abs() < 1e-9);
  }
}
