//! JSON REST API over the contact store and the reveal pipeline.
//!
//! Exposes an axum [`Router`] backed by any [`ContactStore`] and
//! [`RevealProvider`]. Auth, TLS, and transport concerns are the caller's
//! responsibility.
//!
//! # Mounting
//!
//! ```rust,ignore
//! .nest("/api", reveal_api::api_router(state))
//! ```

pub mod contacts;
pub mod error;
pub mod requests;
pub mod submit;

use std::sync::Arc;

use axum::{
  Router,
  routing::{get, post},
};
use reveal_core::store::ContactStore;
use reveal_pipeline::{MergeEngine, RequestTracker, RevealProvider, Submitter};

pub use error::ApiError;

/// Shared handles the API reads and drives.
pub struct ApiState<S, P> {
  pub store:     Arc<S>,
  pub merge:     Arc<MergeEngine<S>>,
  pub tracker:   Arc<RequestTracker>,
  pub submitter: Arc<Submitter<P>>,
}

impl<S, P> Clone for ApiState<S, P> {
  fn clone(&self) -> Self {
    Self {
      store:     self.store.clone(),
      merge:     self.merge.clone(),
      tracker:   self.tracker.clone(),
      submitter: self.submitter.clone(),
    }
  }
}

/// Build the API router.
///
/// The returned `Router<()>` can be nested into any parent router regardless
/// of its own state type.
pub fn api_router<S, P>(state: ApiState<S, P>) -> Router<()>
where
  S: ContactStore + 'static,
  P: RevealProvider + 'static,
{
  Router::new()
    // Contacts
    .route("/contacts", get(contacts::list::<S, P>).post(contacts::import::<S, P>))
    .route("/contacts/{key}", get(contacts::get_one::<S, P>))
    // Pending requests
    .route("/requests", get(requests::list::<S, P>))
    .route("/requests/{id}", get(requests::get_one::<S, P>))
    // Submission
    .route("/submit", post(submit::handler::<S, P>))
    .with_state(state)
}

// ─── Integration tests ────────────────────────────────────────────────────────
