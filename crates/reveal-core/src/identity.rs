//! Identity keys and their normalisation.
//!
//! Two contact records refer to the same person when they share any identity
//! key. Keys are compared in strict priority order: subject id, then LinkedIn
//! profile URL, then email address.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::subject::SubjectId;

/// One normalised identity key.
///
/// The derived `Ord` follows declaration order, which is also match priority.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum IdentityKey {
  SubjectId(SubjectId),
  /// Normalised with [`normalize_linkedin_url`].
  Linkedin(String),
  /// Normalised with [`normalize_email`].
  Email(String),
}

impl IdentityKey {
  pub fn linkedin(raw: &str) -> Option<Self> {
    normalize_linkedin_url(raw).map(Self::Linkedin)
  }

  pub fn email(raw: &str) -> Option<Self> {
    normalize_email(raw).map(Self::Email)
  }

  /// Stable record key derived from this identity key.
  ///
  /// Only computed once, when a record is first created.
  pub fn primary_key(&self) -> String {
    let digest = Sha256::digest(self.to_string().as_bytes());
    hex::encode(&digest[..16])
  }
}

impl fmt::Display for IdentityKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::SubjectId(id) => write!(f, "subject:{id}"),
      Self::Linkedin(url) => write!(f, "linkedin:{url}"),
      Self::Email(addr) => write!(f, "email:{addr}"),
    }
  }
}

/// Lowercase and strip scheme, `www.`, query, fragment and trailing slashes.
///
/// `https://www.LinkedIn.com/in/Jane-Doe/?trk=x` → `linkedin.com/in/jane-doe`
pub fn normalize_linkedin_url(raw: &str) -> Option<String> {
  let lowered = raw.trim().to_ascii_lowercase();
  let without_scheme = lowered
    .strip_prefix("https://")
    .or_else(|| lowered.strip_prefix("http://"))
    .unwrap_or(&lowered);
  let without_www = without_scheme
    .strip_prefix("www.")
    .unwrap_or(without_scheme);
  let path_end = without_www
    .find(['?', '#'])
    .unwrap_or(without_www.len());
  let normalized = without_www[..path_end].trim_end_matches('/');

  if normalized.is_empty() {
    None
  } else {
    Some(normalized.to_owned())
  }
}

/// Trim and lowercase. Values without an `@` are not usable as keys.
pub fn normalize_email(raw: &str) -> Option<String> {
  let normalized = raw.trim().to_ascii_lowercase();
  match normalized.split_once('@') {
    Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {
      Some(normalized)
    }
    _ => None,
  }
}
