//! Attendance events and the once-per-day gate in front of them.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::SharedConnection;
use crate::identity::IdentityKey;
use crate::locks::KeyedLocks;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("attendance database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("invalid attendance row: {0}")]
    InvalidRow(String),
}

/// One check-in of one identity on one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub id: Uuid,
    pub identity: String,
    pub date: NaiveDate,
    pub timestamp: DateTime<Utc>,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// An event for the same identity and date already exists; nothing written.
    Duplicate,
}

/// Persistent attendance register. At most one event per (identity, date).
pub trait AttendanceRepository: Send + Sync {
    fn exists(&self, identity: &IdentityKey, date: NaiveDate) -> Result<bool, AttendanceError>;
    fn insert(&self, event: &AttendanceEvent) -> Result<InsertOutcome, AttendanceError>;
    /// Events for `date`, newest first.
    fn on_date(&self, date: NaiveDate) -> Result<Vec<AttendanceEvent>, AttendanceError>;
    /// Drop every event of `identity`; returns how many were removed.
    fn remove_identity(&self, identity: &IdentityKey) -> Result<usize, AttendanceError>;
}

const ATTENDANCE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS attendance (
    id           TEXT PRIMARY KEY,
    identity_key TEXT NOT NULL,
    date         TEXT NOT NULL,
    timestamp    TEXT NOT NULL,
    confidence   REAL NOT NULL,
    UNIQUE(identity_key, date)
);
CREATE INDEX IF NOT EXISTS attendance_by_date ON attendance(date);
";

pub struct SqliteAttendanceRepository {
    db: SharedConnection,
}

impl SqliteAttendanceRepository {
    pub fn open(path: &Path) -> Result<Self, AttendanceError> {
        Ok(Self {
            db: SharedConnection::open(path, ATTENDANCE_SCHEMA)?,
        })
    }

    pub fn open_in_memory() -> Result<Self, AttendanceError> {
        Ok(Self {
            db: SharedConnection::open_in_memory(ATTENDANCE_SCHEMA)?,
        })
    }
}

fn date_text(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<[String; 4]> {
    Ok([row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?])
}

fn parse_event(columns: [String; 4], confidence: f64) -> Result<AttendanceEvent, AttendanceError> {
    let [id, identity, date, timestamp] = columns;
    let id = Uuid::parse_str(&id)
        .map_err(|err| AttendanceError::InvalidRow(format!("id '{id}': {err}")))?;
    let date = NaiveDate::parse_from_str(&date, DATE_FORMAT)
        .map_err(|err| AttendanceError::InvalidRow(format!("date '{date}': {err}")))?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|err| AttendanceError::InvalidRow(format!("timestamp '{timestamp}': {err}")))?
        .with_timezone(&Utc);
    Ok(AttendanceEvent {
        id,
        identity,
        date,
        timestamp,
        confidence: confidence as f32,
    })
}

impl AttendanceRepository for SqliteAttendanceRepository {
    fn exists(&self, identity: &IdentityKey, date: NaiveDate) -> Result<bool, AttendanceError> {
        let conn = self.db.lock();
        let found: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM attendance WHERE identity_key = ?1 AND date = ?2)",
            params![identity.as_str(), date_text(date)],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    fn insert(&self, event: &AttendanceEvent) -> Result<InsertOutcome, AttendanceError> {
        let conn = self.db.lock();
        let changed = conn.execute(
            "INSERT INTO attendance (id, identity_key, date, timestamp, confidence)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(identity_key, date) DO NOTHING",
            params![
                event.id.to_string(),
                event.identity,
                date_text(event.date),
                event.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
                f64::from(event.confidence),
            ],
        )?;
        Ok(if changed == 0 {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Inserted
        })
    }

    fn on_date(&self, date: NaiveDate) -> Result<Vec<AttendanceEvent>, AttendanceError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, identity_key, date, timestamp, confidence FROM attendance
             WHERE date = ?1
             ORDER BY timestamp DESC, identity_key ASC",
        )?;
        let rows = stmt.query_map(params![date_text(date)], |row| {
            Ok((event_from_row(row)?, row.get::<_, f64>(4)?))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (columns, confidence) = row?;
            events.push(parse_event(columns, confidence)?);
        }
        Ok(events)
    }

    fn remove_identity(&self, identity: &IdentityKey) -> Result<usize, AttendanceError> {
        let conn = self.db.lock();
        let removed = conn.execute(
            "DELETE FROM attendance WHERE identity_key = ?1",
            params![identity.as_str()],
        )?;
        Ok(removed)
    }
}

/// Result of passing a recognized identity through the gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttendanceStatus {
    Recorded { event: AttendanceEvent },
    AlreadyRecorded { date: NaiveDate },
}

/// Records at most one attendance event per identity per day.
///
/// The existence check and the insert run under a lock for the
/// (identity, date) pair; the repository's unique constraint covers writers
/// outside this process.
pub struct AttendanceGate {
    repository: Arc<dyn AttendanceRepository>,
    locks: KeyedLocks,
}

impl AttendanceGate {
    pub fn new(repository: Arc<dyn AttendanceRepository>) -> Self {
        Self {
            repository,
            locks: KeyedLocks::new(),
        }
    }

    pub fn record(
        &self,
        identity: &IdentityKey,
        date: NaiveDate,
        confidence: f32,
    ) -> Result<AttendanceStatus, AttendanceError> {
        let slot = format!("{identity}@{date}");
        self.locks.with_lock(&slot, || {
            if self.repository.exists(identity, date)? {
                tracing::debug!(identity = %identity, %date, "attendance already recorded");
                return Ok(AttendanceStatus::AlreadyRecorded { date });
            }

            let event = AttendanceEvent {
                id: Uuid::new_v4(),
                identity: identity.as_str().to_string(),
                date,
                timestamp: Utc::now(),
                confidence,
            };
            match self.repository.insert(&event)? {
                InsertOutcome::Inserted => {
                    tracing::info!(identity = %identity, %date, confidence, "attendance recorded");
                    Ok(AttendanceStatus::Recorded { event })
                }
                InsertOutcome::Duplicate => Ok(AttendanceStatus::AlreadyRecorded { date }),
            }
        })
    }

    pub fn on_date(&self, date: NaiveDate) -> Result<Vec<AttendanceEvent>, AttendanceError> {
        self.repository.on_date(date)
    }

    pub fn remove_identity(&self, identity: &IdentityKey) -> Result<usize, AttendanceError> {
        self.repository.remove_identity(identity)
    }
}
