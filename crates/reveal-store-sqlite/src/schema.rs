//! SQL schema for the reveal SQLite store.
//!
//! Executed once at connection startup via `PRAGMA user_version`. Future
//! migrations will be gated on that version number.

/// Full schema DDL; idempotent thanks to `IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;

-- Rows are never deleted; merges only fill empty columns.
CREATE TABLE IF NOT EXISTS contacts (
    primary_key   TEXT PRIMARY KEY,
    subject_id    TEXT,
    linkedin_url  TEXT,
    linkedin_key  TEXT,            -- normalised linkedin_url
    email         TEXT,
    email_key     TEXT,            -- normalised email
    phone         TEXT,
    name          TEXT,
    title         TEXT,
    company       TEXT,
    status        TEXT NOT NULL DEFAULT 'new',
    last_updated  TEXT NOT NULL    -- ISO 8601 UTC
);

-- One record per identity key. NULLs do not collide.
CREATE UNIQUE INDEX IF NOT EXISTS contacts_subject_idx  ON contacts(subject_id);
CREATE UNIQUE INDEX IF NOT EXISTS contacts_linkedin_idx ON contacts(linkedin_key);
CREATE UNIQUE INDEX IF NOT EXISTS contacts_email_idx    ON contacts(email_key);
CREATE INDEX IF NOT EXISTS contacts_status_idx ON contacts(status);

PRAGMA user_version = 1;
";
