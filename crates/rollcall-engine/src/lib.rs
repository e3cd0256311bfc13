//! rollcall-engine: enrollment, recognition and once-per-day attendance on
//! top of `rollcall-core`.
//!
//! Artifacts live under one data directory:
//! `signatures/encoding_<key>.json`, `photos/photo_<key>.jpg` and
//! `rollcall.db` (identity directory and attendance register).

pub mod attendance;
pub mod config;
mod db;
pub mod engine;
pub mod enrollment;
pub mod errors;
pub mod identity;
pub mod locks;
pub mod photos;
pub mod pipeline;
pub mod recognition;
pub mod store;

pub use attendance::{
    AttendanceError, AttendanceEvent, AttendanceGate, AttendanceRepository, AttendanceStatus,
    InsertOutcome, SqliteAttendanceRepository,
};
pub use config::{ConfigError, EngineConfig};
pub use engine::{Engine, EngineError, EngineHandle, EngineStatus};
pub use enrollment::{EnrollmentError, EnrollmentRecord, EnrollmentService, RemovalOutcome};
pub use errors::{StoreError, StoreResult};
pub use identity::{IdentityDirectory, IdentityKey, InvalidIdentityKey, SqliteIdentityDirectory};
pub use locks::KeyedLocks;
pub use photos::{PhotoStore, StagedPhoto};
pub use pipeline::{select_primary, FacePipeline, InferenceError};
pub use recognition::{RecognitionError, RecognitionOutcome, RecognitionService, RetryReason};
pub use store::{FileSignatureStore, SignatureScan, SignatureStore};
