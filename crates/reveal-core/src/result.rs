//! Reveal results as delivered by the provider's callback.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::subject::SubjectId;

/// Outcome the provider reports for a single subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevealStatus {
  /// Contact details were found (some fields may still be empty).
  Success,
  /// The provider explicitly found no contact information.
  NotFound,
  /// The provider failed to process the subject.
  Failed,
}

/// Contact details carried by a result. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevealFields {
  pub email:        Option<String>,
  pub phone:        Option<String>,
  pub name:         Option<String>,
  pub title:        Option<String>,
  pub company:      Option<String>,
  /// Profile URLs keyed by network name, e.g. `"linkedin"`.
  #[serde(default)]
  pub profile_urls: BTreeMap<String, String>,
}

impl RevealFields {
  /// The LinkedIn profile URL, if one was delivered.
  pub fn linkedin_url(&self) -> Option<&str> {
    self
      .profile_urls
      .iter()
      .find(|(network, _)| network.eq_ignore_ascii_case("linkedin"))
      .map(|(_, url)| url.as_str())
  }
}

/// A parsed, immutable per-subject result. Consumed once by the merge engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevealResult {
  pub subject_id:  SubjectId,
  pub status:      RevealStatus,
  pub fields:      RevealFields,
  pub received_at: DateTime<Utc>,
}
