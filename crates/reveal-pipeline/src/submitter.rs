//! Batch submission: rate limiter, retry policy, provider and tracker
//! composed into one call.
//!
//! Subjects are reserved in the tracker before any provider call, so
//! overlapping submissions never send the same subject twice. Each retry
//! attempt re-acquires tokens; a retried call is a new outbound call. The
//! limiter and the tracker are never locked together.

use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::Utc;
use reveal_core::subject::SubjectId;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use crate::{
  provider::{ProviderError, RevealAccepted, RevealProvider, RevealRequest},
  rate_limit::{RateLimitError, RateLimiter},
  retry::{Classify, ErrorKind, RetryPolicy},
  tracker::{RequestTracker, Reservation},
};

// ─── Summary ─────────────────────────────────────────────────────────────────

/// Per-item outcome of [`Submitter::submit`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionSummary {
  pub requested:   usize,
  pub accepted:    usize,
  pub rejected:    usize,
  pub request_ids: Vec<String>,
  pub errors:      Vec<ItemError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemError {
  pub subject_id: String,
  pub error:      String,
}

impl SubmissionSummary {
  fn reject(&mut self, subject_id: impl Into<String>, error: impl Into<String>) {
    self.rejected += 1;
    self.errors.push(ItemError { subject_id: subject_id.into(), error: error.into() });
  }

  fn reject_all<'a>(
    &mut self,
    subject_ids: impl IntoIterator<Item = &'a SubjectId>,
    error: &str,
  ) {
    for id in subject_ids {
      self.reject(id.as_str(), error);
    }
  }
}

/// Conditions that stop a submission part-way. Work done before the stop is
/// reported in `partial`.
#[derive(Debug, Error)]
pub enum SubmitError {
  #[error("deadline elapsed while waiting for rate-limit tokens")]
  DeadlineElapsed { partial: SubmissionSummary },

  #[error("provider rate limit exceeded")]
  RateLimited {
    retry_after: Option<Duration>,
    partial:     SubmissionSummary,
  },
}

impl SubmitError {
  pub fn partial(&self) -> &SubmissionSummary {
    match self {
      Self::DeadlineElapsed { partial } | Self::RateLimited { partial, .. } => partial,
    }
  }
}

/// One attempt's failure, local or remote.
#[derive(Debug, Error)]
enum AttemptError {
  #[error(transparent)]
  Limiter(#[from] RateLimitError),
  #[error(transparent)]
  Provider(#[from] ProviderError),
}

impl Classify for AttemptError {
  fn kind(&self) -> ErrorKind {
    match self {
      Self::Limiter(_) => ErrorKind::Permanent,
      Self::Provider(e) => e.kind(),
    }
  }
}

// ─── Submitter ───────────────────────────────────────────────────────────────

pub struct Submitter<P> {
  provider:     P,
  limiter:      Arc<RateLimiter>,
  tracker:      Arc<RequestTracker>,
  policy:       RetryPolicy,
  callback_url: String,
  batch_size:   usize,
}

impl<P: RevealProvider> Submitter<P> {
  pub fn new(
    provider:     P,
    limiter:      Arc<RateLimiter>,
    tracker:      Arc<RequestTracker>,
    policy:       RetryPolicy,
    callback_url: impl Into<String>,
    batch_size:   usize,
  ) -> Self {
    let batch_size = batch_size.clamp(1, limiter.capacity().max(1) as usize);
    Self {
      provider,
      limiter,
      tracker,
      policy,
      callback_url: callback_url.into(),
      batch_size,
    }
  }

  pub fn provider(&self) -> &P { &self.provider }

  pub fn tracker(&self) -> &Arc<RequestTracker> { &self.tracker }

  pub fn limiter(&self) -> &Arc<RateLimiter> { &self.limiter }

  /// Submit `subject_ids` in batches, registering every accepted batch.
  ///
  /// Bad or already-pending ids and batches the provider refuses are
  /// reported per item. A `deadline` bounds only the wait for tokens.
  pub async fn submit<I>(
    &self,
    subject_ids: I,
    deadline:    Option<Instant>,
  ) -> Result<SubmissionSummary, SubmitError>
  where
    I: IntoIterator,
    I::Item: AsRef<str>,
  {
    let mut summary = SubmissionSummary::default();
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    for raw in subject_ids {
      summary.requested += 1;
      let raw = raw.as_ref();
      let Ok(id) = SubjectId::new(raw) else {
        summary.reject(raw, "subject id must not be blank");
        continue;
      };
      if seen.insert(id.clone()) {
        candidates.push(id);
      } else {
        summary.reject(id.as_str(), "duplicate subject id in submission");
      }
    }

    // Released on every early return, and if this future is dropped.
    let (mut held, conflicts) = self.tracker.reserve_available(&candidates);
    for (subject_id, conflict) in conflicts {
      summary.reject(subject_id.as_str(), conflict.to_string());
    }

    let queue = held.subject_ids().to_vec();
    let mut batches = queue.chunks(self.batch_size);
    while let Some(batch) = batches.next() {
      let request = RevealRequest {
        subject_ids:  batch.to_vec(),
        callback_url: self.callback_url.clone(),
      };

      match self.submit_batch(&request, deadline).await {
        Ok((accepted, attempt)) => {
          self.limiter.recover();
          self.register(&mut summary, &mut held, accepted, &request.subject_ids, attempt);
        }
        Err(AttemptError::Limiter(RateLimitError::DeadlineElapsed)) => {
          summary.reject_all(batch, "deadline elapsed before submission");
          summary.reject_all(batches.by_ref().flatten(), "deadline elapsed before submission");
          tracing::warn!(
            accepted = summary.accepted,
            rejected = summary.rejected,
            "submission deadline elapsed"
          );
          return Err(SubmitError::DeadlineElapsed { partial: summary });
        }
        Err(AttemptError::Provider(err)) if err.kind == ErrorKind::RateLimited => {
          self.limiter.throttle(err.retry_after);
          summary.reject_all(batch, "provider rate limit exceeded");
          summary.reject_all(batches.by_ref().flatten(), "provider rate limit exceeded");
          return Err(SubmitError::RateLimited {
            retry_after: err.retry_after,
            partial:     summary,
          });
        }
        Err(err) => {
          tracing::warn!(subjects = batch.len(), error = %err, "batch submission failed");
          held.release(batch);
          summary.reject_all(batch, &format!("submission failed: {err}"));
        }
      }
    }

    tracing::info!(
      requested = summary.requested,
      accepted = summary.accepted,
      rejected = summary.rejected,
      requests = summary.request_ids.len(),
      "submission finished"
    );
    Ok(summary)
  }

  /// One batch through the retry policy. Returns the acceptance and the
  /// attempt that produced it.
  async fn submit_batch(
    &self,
    request:  &RevealRequest,
    deadline: Option<Instant>,
  ) -> Result<(RevealAccepted, u32), AttemptError> {
    let tokens = request.subject_ids.len() as u32;
    self
      .policy
      .run(move |attempt| async move {
        self.limiter.acquire_until(tokens, deadline).await?;
        let accepted = self.provider.reveal(request).await?;
        Ok::<_, AttemptError>((accepted, attempt))
      })
      .await
  }

  fn register(
    &self,
    summary:     &mut SubmissionSummary,
    held:        &mut Reservation<'_>,
    accepted:    RevealAccepted,
    subject_ids: &[SubjectId],
    attempt:     u32,
  ) {
    match held.commit(subject_ids, accepted.request_id.clone(), attempt, Utc::now()) {
      Ok(_) => {
        summary.accepted += subject_ids.len();
        summary.request_ids.push(accepted.request_id);
      }
      Err(err) => {
        // The provider holds the batch but its callback will not correlate.
        tracing::warn!(request_id = %accepted.request_id, error = %err, "could not track accepted request");
        held.release(subject_ids);
        summary.reject_all(subject_ids, &err.to_string());
      }
    }
  }
}
