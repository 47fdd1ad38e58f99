//! Error types for `reveal-core`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("subject id must not be blank")]
  BlankSubjectId,

  #[error("unknown contact status: {0:?}")]
  UnknownStatus(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
