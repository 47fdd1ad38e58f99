//! Strict parser for provider callback bodies.
//!
//! All knowledge of the provider's result format lives here. The body is
//! either a bare JSON array of items or a versioned envelope:
//!
//! ```json
//! { "version": 1, "requestId": "r-1", "results": [ { "subjectId": "s1", "status": "success", "email": "a@x.com" } ] }
//! ```
//!
//! A body that is not JSON, or not one of those two shapes, is rejected as a
//! whole. A malformed item is reported on its own and never affects its
//! siblings.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use reveal_core::{
  result::{RevealFields, RevealResult, RevealStatus},
  subject::SubjectId,
};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

pub const SUPPORTED_VERSION: u64 = 1;

/// The body as a whole could not be read.
#[derive(Debug, Error)]
pub enum PayloadError {
  #[error("payload is not valid JSON: {0}")]
  Json(#[from] serde_json::Error),

  #[error("unsupported payload version {0}")]
  UnsupportedVersion(u64),

  #[error("payload must be a JSON array or an object with a `results` array")]
  Shape,
}

/// One item could not be turned into a [`RevealResult`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ItemError {
  #[error("malformed item: {0}")]
  Malformed(String),

  #[error("item has no subject id")]
  MissingSubjectId,

  #[error("item has no status")]
  MissingStatus,

  #[error("unknown status {0:?}")]
  UnknownStatus(String),

  #[error("no request id in item, envelope or header")]
  MissingRequestId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedItem {
  pub request_id: String,
  pub result:     RevealResult,
}

#[derive(Debug, Default)]
pub struct ParsedPayload {
  pub items:  Vec<ParsedItem>,
  /// `(index in payload, subject id if known, error)`.
  pub errors: Vec<(usize, Option<String>, ItemError)>,
}

// ─── Raw shapes ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
  version:    Option<u64>,
  request_id: Option<String>,
  results:    Vec<Value>,
}

/// Ids arrive as strings, occasionally as numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
  Text(String),
  Number(serde_json::Number),
}

impl RawId {
  fn into_string(self) -> String {
    match self {
      Self::Text(s) => s,
      Self::Number(n) => n.to_string(),
    }
  }
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFields {
  email:        Option<String>,
  phone:        Option<String>,
  name:         Option<String>,
  title:        Option<String>,
  company:      Option<String>,
  profile_urls: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawItem {
  subject_id: Option<RawId>,
  item:       Option<RawId>,
  id:         Option<RawId>,
  request_id: Option<RawId>,
  status:     Option<String>,
  #[serde(flatten)]
  flat:       RawFields,
  fields:     Option<RawFields>,
}

// ─── Parsing ─────────────────────────────────────────────────────────────────

/// Parse a callback body. `header_request_id` is the `Request-Id` header, used
/// for items that carry no request id of their own.
pub fn parse(
  header_request_id: Option<&str>,
  body:              &[u8],
  received_at:       DateTime<Utc>,
) -> Result<ParsedPayload, PayloadError> {
  let (default_request_id, items) = match serde_json::from_slice::<Value>(body)? {
    Value::Array(items) => (header_request_id.map(str::to_owned), items),
    value @ Value::Object(_) => {
      let envelope: Envelope =
        serde_json::from_value(value).map_err(|_| PayloadError::Shape)?;
      let version = envelope.version.unwrap_or(SUPPORTED_VERSION);
      if version != SUPPORTED_VERSION {
        return Err(PayloadError::UnsupportedVersion(version));
      }
      let default = envelope
        .request_id
        .or_else(|| header_request_id.map(str::to_owned));
      (default, envelope.results)
    }
    _ => return Err(PayloadError::Shape),
  };
  let default_request_id = default_request_id.filter(|id| !id.trim().is_empty());

  let mut parsed = ParsedPayload::default();
  for (index, value) in items.into_iter().enumerate() {
    match parse_item(value, default_request_id.as_deref(), received_at) {
      Ok(item) => parsed.items.push(item),
      Err((subject_id, err)) => {
        tracing::warn!(index, subject_id = ?subject_id, error = %err, "skipping malformed callback item");
        parsed.errors.push((index, subject_id, err));
      }
    }
  }
  Ok(parsed)
}

fn parse_item(
  value:              Value,
  default_request_id: Option<&str>,
  received_at:        DateTime<Utc>,
) -> Result<ParsedItem, (Option<String>, ItemError)> {
  let raw: RawItem = serde_json::from_value(value)
    .map_err(|e| (None, ItemError::Malformed(e.to_string())))?;

  let raw_id = raw
    .subject_id
    .or(raw.item)
    .or(raw.id)
    .map(RawId::into_string)
    .ok_or((None, ItemError::MissingSubjectId))?;
  let subject_id =
    SubjectId::new(&raw_id).map_err(|_| (None, ItemError::MissingSubjectId))?;
  let fail = |err: ItemError| (Some(subject_id.to_string()), err);

  let request_id = raw
    .request_id
    .map(RawId::into_string)
    .filter(|id| !id.trim().is_empty())
    .or_else(|| default_request_id.map(str::to_owned))
    .ok_or_else(|| fail(ItemError::MissingRequestId))?;

  let status = raw
    .status
    .as_deref()
    .ok_or_else(|| fail(ItemError::MissingStatus))
    .and_then(|s| parse_status(s).ok_or_else(|| fail(ItemError::UnknownStatus(s.to_owned()))))?;

  let nested = raw.fields.unwrap_or_default();
  let flat = raw.flat;
  let mut profile_urls = nested.profile_urls.unwrap_or_default();
  profile_urls.extend(flat.profile_urls.unwrap_or_default());

  let fields = RevealFields {
    email: flat.email.or(nested.email),
    phone: flat.phone.or(nested.phone),
    name: flat.name.or(nested.name),
    title: flat.title.or(nested.title),
    company: flat.company.or(nested.company),
    profile_urls,
  };

  Ok(ParsedItem {
    request_id: request_id.trim().to_owned(),
    result: RevealResult { subject_id, status, fields, received_at },
  })
}

/// Canonical names plus the spellings providers use in practice.
fn parse_status(raw: &str) -> Option<RevealStatus> {
  let normalized = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
  match normalized.as_str() {
    "success" | "ok" | "found" | "revealed" | "completed" => Some(RevealStatus::Success),
    "not_found" | "notfound" | "no_data" | "no_contact_info" | "empty" => {
      Some(RevealStatus::NotFound)
    }
    "failed" | "failure" | "error" => Some(RevealStatus::Failed),
    _ => None,
  }
}
