//! API error type and [`axum::response::IntoResponse`] implementation.

use std::time::Duration;

use axum::{
  Json,
  http::{HeaderValue, StatusCode, header},
  response::{IntoResponse, Response},
};
use reveal_pipeline::{MergeError, SubmissionSummary, SubmitError};
use serde_json::json;
use thiserror::Error;

/// An error returned by an API handler.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("not found: {0}")]
  NotFound(String),

  #[error("bad request: {0}")]
  BadRequest(String),

  #[error("provider rate limit exceeded")]
  RateLimited {
    retry_after: Option<Duration>,
    partial:     SubmissionSummary,
  },

  #[error("submission deadline elapsed")]
  DeadlineElapsed(SubmissionSummary),

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl From<MergeError> for ApiError {
  fn from(err: MergeError) -> Self {
    match err {
      MergeError::NoIdentity => ApiError::BadRequest(MergeError::NoIdentity.to_string()),
      MergeError::Store(e) => ApiError::Store(e),
    }
  }
}

impl From<SubmitError> for ApiError {
  fn from(err: SubmitError) -> Self {
    match err {
      SubmitError::DeadlineElapsed { partial } => ApiError::DeadlineElapsed(partial),
      SubmitError::RateLimited { retry_after, partial } => {
        ApiError::RateLimited { retry_after, partial }
      }
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let message = self.to_string();
    match self {
      ApiError::NotFound(_) => {
        (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
      }
      ApiError::BadRequest(_) => {
        (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
      }
      ApiError::Store(_) => {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": message })))
          .into_response()
      }
      ApiError::DeadlineElapsed(partial) => (
        StatusCode::GATEWAY_TIMEOUT,
        Json(json!({ "error": message, "partial": partial })),
      )
        .into_response(),
      ApiError::RateLimited { retry_after, partial } => {
        let secs = retry_after.map(|d| d.as_secs());
        let mut res = (
          StatusCode::TOO_MANY_REQUESTS,
          Json(json!({ "error": message, "retryAfterSecs": secs, "partial": partial })),
        )
          .into_response();
        if let Some(secs) = secs {
          res.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        res
      }
    }
  }
}
