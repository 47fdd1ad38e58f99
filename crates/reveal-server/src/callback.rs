//! `POST /callback`: the provider's webhook.
//!
//! Any readable body is acknowledged with 202 so the provider never retries a
//! delivery because of something internal to us. Only an unreadable body
//! gets a 400.

use axum::{
  Json,
  body::Bytes,
  extract::State,
  http::{HeaderMap, StatusCode},
};
use reveal_core::store::ContactStore;
use reveal_pipeline::{HandleOutcome, RevealProvider};
use serde::Serialize;

use crate::{AppState, error::Error};

/// Header names the provider uses for the originating request id.
const REQUEST_ID_HEADERS: [&str; 2] = ["request-id", "x-request-id"];

#[derive(Debug, Serialize)]
pub struct Accepted {
  pub status:  &'static str,
  #[serde(flatten)]
  pub outcome: HandleOutcome,
}

pub async fn handler<S, P>(
  State(state): State<AppState<S, P>>,
  headers: HeaderMap,
  body: Bytes,
) -> Result<(StatusCode, Json<Accepted>), Error>
where
  S: ContactStore,
  P: RevealProvider,
{
  let request_id = REQUEST_ID_HEADERS
    .iter()
    .find_map(|name| headers.get(*name))
    .and_then(|v| v.to_str().ok())
    .map(str::trim)
    .filter(|v| !v.is_empty());

  let outcome = state
    .receiver
    .handle(request_id, &body)
    .await
    .inspect_err(|e| tracing::warn!(request_id, error = %e, "rejected callback payload"))?;

  Ok((StatusCode::ACCEPTED, Json(Accepted { status: "accepted", outcome })))
}
