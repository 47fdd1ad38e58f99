//! [`SqliteStore`]: the SQLite implementation of [`ContactStore`].

use std::path::Path;

use rusqlite::{OptionalExtension as _, types::Value};

use reveal_core::{
  contact::ContactRecord,
  identity::IdentityKey,
  store::{ContactQuery, ContactStore},
};

use crate::{
  encode::{CONTACT_COLUMNS, EncodedContact, RawContact, encode_dt},
  schema::SCHEMA,
  Error, Result,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A contact store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, mostly for tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Run a single-row `SELECT` with `condition` bound to `value`.
  async fn select_one(
    &self,
    condition: &'static str,
    value:     String,
  ) -> Result<Option<ContactRecord>> {
    let raw: Option<RawContact> = self
      .conn
      .call(move |conn| {
        let sql = format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE {condition}");
        Ok(
          conn
            .query_row(&sql, rusqlite::params![value], RawContact::from_row)
            .optional()?,
        )
      })
      .await?;

    raw.map(RawContact::into_record).transpose()
  }
}

// ─── ContactStore impl ───────────────────────────────────────────────────────

impl ContactStore for SqliteStore {
  type Error = Error;

  async fn get(&self, primary_key: &str) -> Result<Option<ContactRecord>> {
    self
      .select_one("primary_key = ?1", primary_key.to_owned())
      .await
  }

  async fn find(&self, key: &IdentityKey) -> Result<Option<ContactRecord>> {
    let (condition, value) = match key {
      IdentityKey::SubjectId(id) => ("subject_id = ?1", id.as_str().to_owned()),
      IdentityKey::Linkedin(url) => ("linkedin_key = ?1", url.clone()),
      IdentityKey::Email(addr) => ("email_key = ?1", addr.clone()),
    };
    self.select_one(condition, value).await
  }

  async fn upsert(&self, record: ContactRecord) -> Result<ContactRecord> {
    let row = EncodedContact::new(&record);
    let primary_key = row.primary_key.clone();

    // `Some(detail)` when a unique index rejected the write.
    let violation: Option<String> = self
      .conn
      .call(move |conn| {
        let outcome = conn.execute(
          "INSERT INTO contacts (
             primary_key, subject_id, linkedin_url, linkedin_key,
             email, email_key, phone, name, title, company,
             status, last_updated
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
           ON CONFLICT(primary_key) DO UPDATE SET
             subject_id   = excluded.subject_id,
             linkedin_url = excluded.linkedin_url,
             linkedin_key = excluded.linkedin_key,
             email        = excluded.email,
             email_key    = excluded.email_key,
             phone        = excluded.phone,
             name         = excluded.name,
             title        = excluded.title,
             company      = excluded.company,
             status       = excluded.status,
             last_updated = excluded.last_updated",
          rusqlite::params![
            row.primary_key,
            row.subject_id,
            row.linkedin_url,
            row.linkedin_key,
            row.email,
            row.email_key,
            row.phone,
            row.name,
            row.title,
            row.company,
            row.status,
            row.last_updated,
          ],
        );

        match outcome {
          Ok(_) => Ok(None),
          Err(rusqlite::Error::SqliteFailure(err, detail))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
          {
            Ok(Some(detail.unwrap_or_else(|| err.to_string())))
          }
          Err(e) => Err(e.into()),
        }
      })
      .await?;

    if let Some(detail) = violation {
      tracing::warn!(%primary_key, %detail, "upsert rejected by identity index");
      return Err(Error::IdentityConflict { primary_key, detail });
    }

    Ok(record)
  }

  async fn query(&self, query: &ContactQuery) -> Result<Vec<ContactRecord>> {
    // Build WHERE clause dynamically; every bound value goes through `params`.
    let mut conds: Vec<String> = vec![];
    let mut params: Vec<Value> = vec![];

    if let Some(text) = &query.text {
      params.push(Value::Text(format!("%{}%", text.to_lowercase())));
      let n = params.len();
      conds.push(format!(
        "(lower(coalesce(name, '')) LIKE ?{n} \
          OR lower(coalesce(title, '')) LIKE ?{n} \
          OR lower(coalesce(company, '')) LIKE ?{n} \
          OR coalesce(email_key, '') LIKE ?{n})"
      ));
    }
    if let Some(status) = query.status {
      params.push(Value::Text(status.as_str().to_owned()));
      conds.push(format!("status = ?{}", params.len()));
    }
    match query.has_email {
      Some(true) => conds.push("email IS NOT NULL".to_owned()),
      Some(false) => conds.push("email IS NULL".to_owned()),
      None => {}
    }
    if let Some(after) = query.updated_after {
      params.push(Value::Text(encode_dt(after)));
      conds.push(format!("last_updated > ?{}", params.len()));
    }

    let where_clause = if conds.is_empty() {
      String::new()
    } else {
      format!("WHERE {}", conds.join(" AND "))
    };

    params.push(Value::Integer(query.limit.unwrap_or(100) as i64));
    let limit_idx = params.len();
    params.push(Value::Integer(query.offset.unwrap_or(0) as i64));
    let offset_idx = params.len();

    let sql = format!(
      "SELECT {CONTACT_COLUMNS} FROM contacts
       {where_clause}
       ORDER BY primary_key
       LIMIT ?{limit_idx} OFFSET ?{offset_idx}"
    );

    let raws: Vec<RawContact> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(rusqlite::params_from_iter(params), RawContact::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawContact::into_record).collect()
  }
}
