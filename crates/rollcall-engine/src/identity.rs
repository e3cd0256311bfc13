//! Identity keys and the display-name directory.

use std::fmt;
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use thiserror::Error;

use crate::db::SharedConnection;
use crate::errors::StoreResult;

const MAX_KEY_LEN: usize = 64;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid identity key '{key}': {reason}")]
pub struct InvalidIdentityKey {
    pub key: String,
    pub reason: &'static str,
}

/// Stable identifier for an enrolled person. Safe to embed in file names.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn parse(key: &str) -> Result<Self, InvalidIdentityKey> {
        let invalid = |reason| InvalidIdentityKey {
            key: key.to_string(),
            reason,
        };

        if key.is_empty() {
            return Err(invalid("identity key cannot be empty"));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(invalid("identity key is longer than 64 characters"));
        }
        if !key
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
        {
            return Err(invalid("use ASCII letters, numbers, '-' or '_' only"));
        }

        Ok(Self(key.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolves identity keys to human-readable names. Owned by the surrounding
/// application; the engine only reads from it after a match and keeps it in
/// step with enroll/remove.
pub trait IdentityDirectory: Send + Sync {
    fn display_name(&self, identity: &IdentityKey) -> StoreResult<Option<String>>;
    fn upsert(&self, identity: &IdentityKey, display_name: &str) -> StoreResult<()>;
    /// Returns whether an entry existed.
    fn remove(&self, identity: &IdentityKey) -> StoreResult<bool>;
}

const IDENTITY_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    identity_key  TEXT PRIMARY KEY,
    display_name  TEXT NOT NULL,
    registered_at TEXT NOT NULL
);
";

/// [`IdentityDirectory`] backed by the `identities` table.
pub struct SqliteIdentityDirectory {
    db: SharedConnection,
}

impl SqliteIdentityDirectory {
    pub fn open(path: &Path) -> StoreResult<Self> {
        Ok(Self {
            db: SharedConnection::open(path, IDENTITY_SCHEMA)?,
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Ok(Self {
            db: SharedConnection::open_in_memory(IDENTITY_SCHEMA)?,
        })
    }
}

impl IdentityDirectory for SqliteIdentityDirectory {
    fn display_name(&self, identity: &IdentityKey) -> StoreResult<Option<String>> {
        let conn = self.db.lock();
        let name = conn
            .query_row(
                "SELECT display_name FROM identities WHERE identity_key = ?1",
                params![identity.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name)
    }

    fn upsert(&self, identity: &IdentityKey, display_name: &str) -> StoreResult<()> {
        let registered_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO identities (identity_key, display_name, registered_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(identity_key) DO UPDATE SET display_name = excluded.display_name",
            params![identity.as_str(), display_name, registered_at],
        )?;
        Ok(())
    }

    fn remove(&self, identity: &IdentityKey) -> StoreResult<bool> {
        let conn = self.db.lock();
        let removed = conn.execute(
            "DELETE FROM identities WHERE identity_key = ?1",
            params![identity.as_str()],
        )?;
        Ok(removed > 0)
    }
}
