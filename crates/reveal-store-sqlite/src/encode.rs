//! Encoding and decoding helpers between domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! All timestamps are stored as RFC 3339 strings.

use chrono::{DateTime, Utc};
use reveal_core::{
  contact::{ContactRecord, ContactStatus},
  identity::{normalize_email, normalize_linkedin_url},
  subject::SubjectId,
};

use crate::{Error, Result};

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Column list shared by every `SELECT` against `contacts`, in
/// [`RawContact`] field order.
pub const CONTACT_COLUMNS: &str = "primary_key, subject_id, linkedin_url, \
  email, phone, name, title, company, status, last_updated";

/// Raw strings read directly from a `contacts` row.
pub struct RawContact {
  pub primary_key:  String,
  pub subject_id:   Option<String>,
  pub linkedin_url: Option<String>,
  pub email:        Option<String>,
  pub phone:        Option<String>,
  pub name:         Option<String>,
  pub title:        Option<String>,
  pub company:      Option<String>,
  pub status:       String,
  pub last_updated: String,
}

impl RawContact {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      primary_key:  row.get(0)?,
      subject_id:   row.get(1)?,
      linkedin_url: row.get(2)?,
      email:        row.get(3)?,
      phone:        row.get(4)?,
      name:         row.get(5)?,
      title:        row.get(6)?,
      company:      row.get(7)?,
      status:       row.get(8)?,
      last_updated: row.get(9)?,
    })
  }

  pub fn into_record(self) -> Result<ContactRecord> {
    Ok(ContactRecord {
      primary_key:  self.primary_key,
      subject_id:   self.subject_id.map(SubjectId::new).transpose()?,
      linkedin_url: self.linkedin_url,
      email:        self.email,
      phone:        self.phone,
      name:         self.name,
      title:        self.title,
      company:      self.company,
      status:       ContactStatus::parse(&self.status)?,
      last_updated: decode_dt(&self.last_updated)?,
    })
  }
}

/// Column values for an upsert, in `INSERT` order.
pub struct EncodedContact {
  pub primary_key:  String,
  pub subject_id:   Option<String>,
  pub linkedin_url: Option<String>,
  pub linkedin_key: Option<String>,
  pub email:        Option<String>,
  pub email_key:    Option<String>,
  pub phone:        Option<String>,
  pub name:         Option<String>,
  pub title:        Option<String>,
  pub company:      Option<String>,
  pub status:       &'static str,
  pub last_updated: String,
}

impl EncodedContact {
  pub fn new(record: &ContactRecord) -> Self {
    Self {
      primary_key:  record.primary_key.clone(),
      subject_id:   record.subject_id.as_ref().map(|id| id.as_str().to_owned()),
      linkedin_url: record.linkedin_url.clone(),
      linkedin_key: record
        .linkedin_url
        .as_deref()
        .and_then(normalize_linkedin_url),
      email:        record.email.clone(),
      email_key:    record.email.as_deref().and_then(normalize_email),
      phone:        record.phone.clone(),
      name:         record.name.clone(),
      title:        record.title.clone(),
      company:      record.company.clone(),
      status:       record.status.as_str(),
      last_updated: encode_dt(record.last_updated),
    }
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  #[test]
  fn dt_roundtrip() {
    let dt = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
    assert_eq!(decode_dt(&encode_dt(dt)).unwrap(), dt);
  }

  #[test]
  fn decode_dt_rejects_garbage() {
    assert!(matches!(decode_dt("yesterday"), Err(Error::DateParse(_))));
  }
}
