//! Contact records, the canonical unit of the contact store, and the
//! partial records merged into them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  identity::IdentityKey,
  result::{RevealResult, RevealStatus},
  subject::SubjectId,
  Error, Result,
};

// ─── Status ──────────────────────────────────────────────────────────────────

/// How much we know about a contact's reachability.
///
/// Ordered from least to most informative; a record's status only advances.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
  Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
  #[default]
  New,
  NoContactInfo,
  Revealed,
}

impl ContactStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::New => "new",
      Self::NoContactInfo => "no_contact_info",
      Self::Revealed => "revealed",
    }
  }

  pub fn parse(s: &str) -> Result<Self> {
    match s {
      "new" => Ok(Self::New),
      "no_contact_info" => Ok(Self::NoContactInfo),
      "revealed" => Ok(Self::Revealed),
      other => Err(Error::UnknownStatus(other.to_owned())),
    }
  }
}

// ─── Record ──────────────────────────────────────────────────────────────────

/// The canonical, deduplicated record for one real-world contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRecord {
  /// Derived from the first identity key seen; never changes.
  pub primary_key:  String,
  pub subject_id:   Option<SubjectId>,
  pub linkedin_url: Option<String>,
  pub email:        Option<String>,
  pub phone:        Option<String>,
  pub name:         Option<String>,
  pub title:        Option<String>,
  pub company:      Option<String>,
  pub status:       ContactStatus,
  pub last_updated: DateTime<Utc>,
}

impl ContactRecord {
  /// An empty record keyed by `key`.
  pub fn empty(key: &IdentityKey, now: DateTime<Utc>) -> Self {
    Self {
      primary_key:  key.primary_key(),
      subject_id:   None,
      linkedin_url: None,
      email:        None,
      phone:        None,
      name:         None,
      title:        None,
      company:      None,
      status:       ContactStatus::New,
      last_updated: now,
    }
  }

  /// Every identity key this record currently carries, in priority order.
  pub fn identity_keys(&self) -> Vec<IdentityKey> {
    identity_keys(
      self.subject_id.as_ref(),
      self.linkedin_url.as_deref(),
      self.email.as_deref(),
    )
  }

  pub fn has_contact_info(&self) -> bool {
    self.email.is_some() || self.phone.is_some()
  }
}

// ─── Patch ───────────────────────────────────────────────────────────────────

/// A partial contact: a search candidate, an imported row, or a converted
/// [`RevealResult`]. Input to the merge engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactPatch {
  pub subject_id:   Option<SubjectId>,
  pub linkedin_url: Option<String>,
  pub email:        Option<String>,
  pub phone:        Option<String>,
  pub name:         Option<String>,
  pub title:        Option<String>,
  pub company:      Option<String>,
  /// Set when the patch originates from a reveal; drives status advancement.
  #[serde(default)]
  pub outcome:      Option<RevealStatus>,
}

impl ContactPatch {
  /// Identity keys carried by the patch, in priority order.
  pub fn identity_keys(&self) -> Vec<IdentityKey> {
    identity_keys(
      self.subject_id.as_ref(),
      self.linkedin_url.as_deref(),
      self.email.as_deref(),
    )
  }

  /// The status this patch alone justifies.
  pub fn implied_status(&self) -> ContactStatus {
    if self.email.is_some() || self.phone.is_some() {
      ContactStatus::Revealed
    } else if self.outcome == Some(RevealStatus::NotFound) {
      ContactStatus::NoContactInfo
    } else {
      ContactStatus::New
    }
  }

  /// Drop blank strings so they never count as "non-empty" during a merge.
  pub fn scrubbed(mut self) -> Self {
    for field in [
      &mut self.linkedin_url,
      &mut self.email,
      &mut self.phone,
      &mut self.name,
      &mut self.title,
      &mut self.company,
    ] {
      *field = field
        .take()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty());
    }
    self
  }

  /// Fold `other` into `self`, first write wins per field.
  ///
  /// The outcome keeps whichever of the two justifies the higher status, so
  /// folding never loses an explicit "no contact info" answer.
  pub fn absorb(&mut self, other: ContactPatch) {
    fill(&mut self.subject_id, other.subject_id);
    fill(&mut self.linkedin_url, other.linkedin_url);
    fill(&mut self.email, other.email);
    fill(&mut self.phone, other.phone);
    fill(&mut self.name, other.name);
    fill(&mut self.title, other.title);
    fill(&mut self.company, other.company);
    if outcome_rank(other.outcome) > outcome_rank(self.outcome) {
      self.outcome = other.outcome;
    }
  }
}

fn fill<T>(slot: &mut Option<T>, value: Option<T>) {
  if slot.is_none() {
    *slot = value;
  }
}

fn outcome_rank(outcome: Option<RevealStatus>) -> u8 {
  match outcome {
    None => 0,
    Some(RevealStatus::Failed) => 1,
    Some(RevealStatus::Success) => 2,
    Some(RevealStatus::NotFound) => 3,
  }
}

impl From<&RevealResult> for ContactPatch {
  fn from(result: &RevealResult) -> Self {
    let fields = &result.fields;
    ContactPatch {
      subject_id:   Some(result.subject_id.clone()),
      linkedin_url: fields.linkedin_url().map(str::to_owned),
      email:        fields.email.clone(),
      phone:        fields.phone.clone(),
      name:         fields.name.clone(),
      title:        fields.title.clone(),
      company:      fields.company.clone(),
      outcome:      Some(result.status),
    }
    .scrubbed()
  }
}

fn identity_keys(
  subject_id: Option<&SubjectId>,
  linkedin_url: Option<&str>,
  email: Option<&str>,
) -> Vec<IdentityKey> {
  let mut keys = Vec::with_capacity(3);
  if let Some(id) = subject_id {
    keys.push(IdentityKey::SubjectId(id.clone()));
  }
  if let Some(key) = linkedin_url.and_then(IdentityKey::linkedin) {
    keys.push(key);
  }
  if let Some(key) = email.and_then(IdentityKey::email) {
    keys.push(key);
  }
  keys
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::result::RevealFields;

  #[test]
  fn status_order_reflects_information() {
    assert!(ContactStatus::New < ContactStatus::NoContactInfo);
    assert!(ContactStatus::NoContactInfo < ContactStatus::Revealed);
    for status in [
      ContactStatus::New,
      ContactStatus::NoContactInfo,
      ContactStatus::Revealed,
    ] {
      assert_eq!(ContactStatus::parse(status.as_str()).unwrap(), status);
    }
  }

  #[test]
  fn patch_keys_are_in_priority_order() {
    let patch = ContactPatch {
      email: Some("A@X.com".into()),
      linkedin_url: Some("https://linkedin.com/in/a/".into()),
      subject_id: Some(SubjectId::new("s1").unwrap()),
      ..Default::default()
    };
    let keys = patch.identity_keys();
    assert_eq!(keys.len(), 3);
    assert!(matches!(keys[0], IdentityKey::SubjectId(_)));
    assert_eq!(keys[1], IdentityKey::Linkedin("linkedin.com/in/a".into()));
    assert_eq!(keys[2], IdentityKey::Email("a@x.com".into()));
  }

  #[test]
  fn not_found_result_implies_no_contact_info() {
    let result = RevealResult {
      subject_id:  SubjectId::new("s1").unwrap(),
      status:      RevealStatus::NotFound,
      fields:      RevealFields::default(),
      received_at: Utc::now(),
    };
    let patch = ContactPatch::from(&result);
    assert_eq!(patch.implied_status(), ContactStatus::NoContactInfo);
  }

  #[test]
  fn absorb_is_first_write_wins() {
    let mut patch = ContactPatch {
      subject_id: Some(SubjectId::new("1").unwrap()),
      email: Some("a@x.com".into()),
      outcome: Some(RevealStatus::Success),
      ..Default::default()
    };
    patch.absorb(ContactPatch {
      subject_id: Some(SubjectId::new("2").unwrap()),
      email: Some("b@x.com".into()),
      phone: Some("555".into()),
      outcome: Some(RevealStatus::NotFound),
      ..Default::default()
    });
    assert_eq!(patch.subject_id, Some(SubjectId::new("1").unwrap()));
    assert_eq!(patch.email.as_deref(), Some("a@x.com"));
    assert_eq!(patch.phone.as_deref(), Some("555"));
    assert_eq!(patch.outcome, Some(RevealStatus::NotFound));
  }

  #[test]
  fn scrub_drops_blank_fields() {
    let patch = ContactPatch {
      email: Some("   ".into()),
      name: Some(" Jane ".into()),
      ..Default::default()
    }
    .scrubbed();
    assert_eq!(patch.email, None);
    assert_eq!(patch.name.as_deref(), Some("Jane"));
  }
}
