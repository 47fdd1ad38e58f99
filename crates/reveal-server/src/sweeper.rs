//! Periodic expiry of requests whose callbacks never arrived.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use reveal_core::request::PendingRequest;
use reveal_pipeline::RequestTracker;
use tokio::{task::JoinHandle, time::MissedTickBehavior};

/// Sweep `tracker` every `every` until the task is aborted.
pub fn spawn(tracker: Arc<RequestTracker>, every: Duration) -> JoinHandle<()> {
  let every = every.max(Duration::from_secs(1));
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
      ticker.tick().await;
      sweep_once(&tracker, Utc::now());
    }
  })
}

/// One sweep. Each expired request is logged with the subjects that still
/// owe a result, so they can be resubmitted or marked failed.
pub fn sweep_once(tracker: &RequestTracker, now: DateTime<Utc>) -> Vec<PendingRequest> {
  let expired = tracker.sweep(now);
  for request in &expired {
    let unsettled: Vec<&str> = request.unsettled().map(|id| id.as_str()).collect();
    tracing::warn!(
      request_id = %request.request_id,
      attempt = request.attempt,
      submitted_at = %request.submitted_at,
      ?unsettled,
      "request expired before all results arrived"
    );
  }
  expired
}
