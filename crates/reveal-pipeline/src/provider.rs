//! Outbound calls to the enrichment provider.
//!
//! The provider accepts `POST {base}/reveal` with a batch of subject ids and a
//! callback URL, answers with a request id, and delivers results later on the
//! callback. Every failure is reported as a [`ProviderError`] already
//! classified for [`RetryPolicy`](crate::retry::RetryPolicy).

use std::{future::Future, time::Duration};

use reqwest::{StatusCode, header::RETRY_AFTER};
use reveal_core::subject::SubjectId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::{Classify, ErrorKind};

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevealRequest {
  pub subject_ids:  Vec<SubjectId>,
  pub callback_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevealAccepted {
  pub request_id: String,
}

// ─── Errors ──────────────────────────────────────────────────────────────────

/// A failed submission, classified at the point of failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("provider error ({kind:?}{}): {message}", status_note(.status))]
pub struct ProviderError {
  pub kind:        ErrorKind,
  /// HTTP status, when the provider answered at all.
  pub status:      Option<u16>,
  pub message:     String,
  /// Parsed `Retry-After`, only meaningful for [`ErrorKind::RateLimited`].
  pub retry_after: Option<Duration>,
}

impl ProviderError {
  pub fn transient(message: impl Into<String>) -> Self {
    Self { kind: ErrorKind::Transient, status: None, message: message.into(), retry_after: None }
  }

  pub fn permanent(message: impl Into<String>) -> Self {
    Self { kind: ErrorKind::Permanent, status: None, message: message.into(), retry_after: None }
  }

  pub fn rate_limited(retry_after: Option<Duration>) -> Self {
    Self {
      kind: ErrorKind::RateLimited,
      status: Some(StatusCode::TOO_MANY_REQUESTS.as_u16()),
      message: "provider rate limit exceeded".into(),
      retry_after,
    }
  }

  /// Classify a non-success HTTP answer: 429 is a rate-limit signal, 5xx is
  /// transient, anything else is permanent.
  pub fn from_status(
    status:      StatusCode,
    body:        String,
    retry_after: Option<Duration>,
  ) -> Self {
    if status == StatusCode::TOO_MANY_REQUESTS {
      return Self { message: body, ..Self::rate_limited(retry_after) };
    }
    let kind = if status.is_server_error() {
      ErrorKind::Transient
    } else {
      ErrorKind::Permanent
    };
    Self { kind, status: Some(status.as_u16()), message: body, retry_after: None }
  }
}

fn status_note(status: &Option<u16>) -> String {
  status.map(|s| format!(", status {s}")).unwrap_or_default()
}

impl Classify for ProviderError {
  fn kind(&self) -> ErrorKind { self.kind }
}

impl From<reqwest::Error> for ProviderError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_decode() {
      Self::permanent(format!("malformed provider response: {err}"))
    } else if let Some(status) = err.status() {
      Self::from_status(status, err.to_string(), None)
    } else {
      // Timeouts, refused connections, resets.
      Self::transient(err.to_string())
    }
  }
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over the enrichment provider's submission endpoint.
pub trait RevealProvider: Send + Sync {
  /// Submit one batch. A returned request id means the provider accepted it
  /// and will deliver results on the callback.
  fn reveal<'a>(
    &'a self,
    request: &'a RevealRequest,
  ) -> impl Future<Output = Result<RevealAccepted, ProviderError>> + Send + 'a;
}

// ─── HTTP client ─────────────────────────────────────────────────────────────

pub struct HttpProvider {
  client:   reqwest::Client,
  base_url: String,
  api_key:  Option<String>,
}

impl HttpProvider {
  pub fn new(
    base_url: impl Into<String>,
    api_key:  Option<String>,
    timeout:  Duration,
  ) -> reqwest::Result<Self> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    Ok(Self {
      client,
      base_url: base_url.into().trim_end_matches('/').to_owned(),
      api_key,
    })
  }
}

impl RevealProvider for HttpProvider {
  async fn reveal(&self, request: &RevealRequest) -> Result<RevealAccepted, ProviderError> {
    let url = format!("{}/reveal", self.base_url);
    let mut builder = self.client.post(&url).json(request);
    if let Some(key) = &self.api_key {
      builder = builder.bearer_auth(key);
    }
    let resp = builder.send().await?;

    let status = resp.status();
    if !status.is_success() {
      let retry_after = parse_retry_after(resp.headers());
      let body = resp.text().await.unwrap_or_default();
      return Err(ProviderError::from_status(status, body, retry_after));
    }

    let accepted: RevealAccepted = resp.json().await?;
    if accepted.request_id.trim().is_empty() {
      return Err(ProviderError::permanent("provider returned a blank requestId"));
    }
    tracing::debug!(
      request_id = %accepted.request_id,
      subjects = request.subject_ids.len(),
      "provider accepted batch"
    );
    Ok(accepted)
  }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
  headers
    .get(RETRY_AFTER)?
    .to_str()
    .ok()?
    .trim()
    .parse::<u64>()
    .ok()
    .map(Duration::from_secs)
}
