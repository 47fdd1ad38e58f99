//! Subject identifiers: the provider's opaque handle for a candidate contact.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// An opaque identifier for one candidate contact in the provider's namespace.
///
/// Always stored trimmed; never blank.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct SubjectId(String);

impl SubjectId {
  pub fn new(raw: impl AsRef<str>) -> Result<Self> {
    let trimmed = raw.as_ref().trim();
    if trimmed.is_empty() {
      return Err(Error::BlankSubjectId);
    }
    Ok(Self(trimmed.to_owned()))
  }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl TryFrom<String> for SubjectId {
  type Error = Error;

  fn try_from(value: String) -> Result<Self> { Self::new(value) }
}

impl From<SubjectId> for String {
  fn from(id: SubjectId) -> Self { id.0 }
}

impl fmt::Display for SubjectId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn trims_surrounding_whitespace() {
    let id = SubjectId::new("  abc-123\n").unwrap();
    assert_eq!(id.as_str(), "abc-123");
  }

  #[test]
  fn rejects_blank() {
    assert!(matches!(SubjectId::new("   "), Err(Error::BlankSubjectId)));
  }

  #[test]
  fn deserialising_blank_fails() {
    let res: std::result::Result<SubjectId, _> = serde_json::from_str("\" \"");
    assert!(res.is_err());
  }
}
