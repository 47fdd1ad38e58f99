//! Error type for `reveal-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] reveal_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  /// An upsert would give two records the same identity key.
  #[error("identity conflict for record {primary_key}: {detail}")]
  IdentityConflict {
    primary_key: String,
    detail:      String,
  },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
