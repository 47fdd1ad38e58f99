//! Handlers for `/contacts` endpoints.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/contacts` | Query params map to [`ContactQuery`] |
//! | `POST` | `/contacts` | Body: `[ContactPatch]`, merged as one batch |
//! | `GET`  | `/contacts/{key}` | 404 if not found |

use axum::{
  Json,
  extract::{Path, Query, State},
  http::StatusCode,
  response::IntoResponse,
};
use reveal_core::{
  contact::{ContactPatch, ContactRecord},
  store::{ContactQuery, ContactStore},
};
use reveal_pipeline::RevealProvider;

use crate::{ApiState, error::ApiError};

// ─── List ─────────────────────────────────────────────────────────────────────

/// `GET /contacts[?text=..][&status=..][&has_email=..][&updated_after=..][&limit=..][&offset=..]`
pub async fn list<S, P>(
  State(state): State<ApiState<S, P>>,
  Query(query): Query<ContactQuery>,
) -> Result<Json<Vec<ContactRecord>>, ApiError>
where
  S: ContactStore,
  P: RevealProvider,
{
  let records = state
    .store
    .query(&query)
    .await
    .map_err(|e| ApiError::Store(Box::new(e)))?;
  Ok(Json(records))
}

// ─── Import ───────────────────────────────────────────────────────────────────

/// `POST /contacts`: seeds or enriches contacts from search candidates or
/// imported rows. Duplicates inside the batch collapse to one record.
pub async fn import<S, P>(
  State(state): State<ApiState<S, P>>,
  Json(patches): Json<Vec<ContactPatch>>,
) -> Result<impl IntoResponse, ApiError>
where
  S: ContactStore,
  P: RevealProvider,
{
  let count = patches.len();
  let records = state.merge.merge_many(patches).await?;
  tracing::info!(patches = count, records = records.len(), "imported contacts");
  Ok((StatusCode::OK, Json(records)))
}

// ─── Get one ──────────────────────────────────────────────────────────────────

/// `GET /contacts/{key}`
pub async fn get_one<S, P>(
  State(state): State<ApiState<S, P>>,
  Path(key): Path<String>,
) -> Result<Json<ContactRecord>, ApiError>
where
  S: ContactStore,
  P: RevealProvider,
{
  let record = state
    .store
    .get(&key)
    .await
    .map_err(|e| ApiError::Store(Box::new(e)))?
    .ok_or_else(|| ApiError::NotFound(format!("contact {key} not found")))?;
  Ok(Json(record))
}
