//! Handler for `POST /submit`.

use std::time::Duration;

use axum::{Json, extract::State};
use reveal_core::store::ContactStore;
use reveal_pipeline::{RevealProvider, SubmissionSummary};
use serde::Deserialize;
use tokio::time::Instant;

use crate::{ApiState, error::ApiError};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitBody {
  pub subject_ids:  Vec<String>,
  /// Upper bound on the wait for rate-limit tokens.
  pub timeout_secs: Option<u64>,
}

/// `POST /submit`, body: `{"subjectIds": ["..."], "timeoutSecs": 30}`
///
/// 429 when the provider rate-limits, 504 when the deadline elapses. Both
/// carry the partial summary.
pub async fn handler<S, P>(
  State(state): State<ApiState<S, P>>,
  Json(body): Json<SubmitBody>,
) -> Result<Json<SubmissionSummary>, ApiError>
where
  S: ContactStore,
  P: RevealProvider,
{
  let deadline = body
    .timeout_secs
    .and_then(|secs| Instant::now().checked_add(Duration::from_secs(secs)));
  let summary = state.submitter.submit(body.subject_ids, deadline).await?;
  Ok(Json(summary))
}
