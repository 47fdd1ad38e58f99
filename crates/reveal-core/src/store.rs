//! The `ContactStore` trait and supporting query types.
//!
//! The trait is implemented by storage backends (e.g. `reveal-store-sqlite`).
//! Higher layers (`reveal-pipeline`, `reveal-api`) depend on this
//! abstraction, not on any concrete backend.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::{
  contact::{ContactRecord, ContactStatus},
  identity::IdentityKey,
};

// ─── Query type ──────────────────────────────────────────────────────────────

/// Parameters for [`ContactStore::query`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContactQuery {
  /// Case-insensitive substring over name, title, company and email.
  pub text:          Option<String>,
  pub status:        Option<ContactStatus>,
  /// `true` keeps only records with an email, `false` only those without.
  pub has_email:     Option<bool>,
  pub updated_after: Option<DateTime<Utc>>,
  pub limit:         Option<usize>,
  pub offset:        Option<usize>,
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over a contact store backend.
///
/// Records are never deleted. A backend must refuse to hold two records that
/// share any identity key.
///
/// All methods return `Send` futures so the trait can be used in multi-threaded
/// async runtimes (e.g. tokio with `axum`).
pub trait ContactStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Retrieve a record by primary key. Returns `None` if not found.
  fn get<'a>(
    &'a self,
    primary_key: &'a str,
  ) -> impl Future<Output = Result<Option<ContactRecord>, Self::Error>> + Send + 'a;

  /// Find the record carrying `key`, if any.
  fn find<'a>(
    &'a self,
    key: &'a IdentityKey,
  ) -> impl Future<Output = Result<Option<ContactRecord>, Self::Error>> + Send + 'a;

  /// Insert `record`, or replace the stored record with the same primary key.
  fn upsert(
    &self,
    record: ContactRecord,
  ) -> impl Future<Output = Result<ContactRecord, Self::Error>> + Send + '_;

  /// Records matching `query`, ordered by primary key.
  fn query<'a>(
    &'a self,
    query: &'a ContactQuery,
  ) -> impl Future<Output = Result<Vec<ContactRecord>, Self::Error>> + Send + 'a;
}
