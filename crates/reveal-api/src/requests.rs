//! Read-only view of the pending-request tracker.

use axum::{
  Json,
  extract::{Path, State},
};
use reveal_core::{request::PendingRequest, store::ContactStore};
use reveal_pipeline::RevealProvider;

use crate::{ApiState, error::ApiError};

/// `GET /requests`, oldest first.
pub async fn list<S, P>(State(state): State<ApiState<S, P>>) -> Json<Vec<PendingRequest>>
where
  S: ContactStore,
  P: RevealProvider,
{
  Json(state.tracker.list())
}

/// `GET /requests/{id}`
pub async fn get_one<S, P>(
  State(state): State<ApiState<S, P>>,
  Path(id): Path<String>,
) -> Result<Json<PendingRequest>, ApiError>
where
  S: ContactStore,
  P: RevealProvider,
{
  state
    .tracker
    .get(&id)
    .map(Json)
    .ok_or_else(|| ApiError::NotFound(format!("request {id} not found")))
}
