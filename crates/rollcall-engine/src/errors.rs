use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure reading or writing persisted artifacts: signatures, photos or the
/// identity directory. Never retried inside the engine.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("signature record {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("signature length mismatch: store holds {expected}-value signatures, got {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("failed to encode photo {path}: {source}")]
    PhotoEncode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
