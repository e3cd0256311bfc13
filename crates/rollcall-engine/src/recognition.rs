//! Recognition: live photo in, identity and attendance status out.

use std::sync::Arc;

use chrono::NaiveDate;
use rollcall_core::{decode_input, EuclideanMatcher, ImageInput, MatchOutcome, Matcher};
use serde::Serialize;
use thiserror::Error;

use crate::attendance::{AttendanceError, AttendanceEvent, AttendanceGate, AttendanceStatus};
use crate::errors::StoreError;
use crate::identity::{IdentityDirectory, IdentityKey};
use crate::pipeline::{select_primary, FacePipeline, InferenceError};
use crate::store::SignatureStore;

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("inference failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("storage failure: {0}")]
    StorageFailure(#[from] StoreError),
    #[error("attendance storage failure: {0}")]
    Attendance(#[from] AttendanceError),
}

/// Why the caller should capture another photo.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RetryReason {
    InvalidImage { message: String },
    NoFaceDetected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecognitionOutcome {
    Recognized {
        identity: IdentityKey,
        display_name: Option<String>,
        confidence: f32,
        attendance: AttendanceStatus,
    },
    /// A face was compared but no enrolled identity was close enough.
    NotRecognized { best_confidence: f32 },
    NoRegisteredIdentities,
    /// Serialized flat: `{"outcome": "try_again", "reason": ...}`.
    TryAgain(RetryReason),
}

pub struct RecognitionService {
    pipeline: Arc<FacePipeline>,
    signatures: Arc<dyn SignatureStore>,
    directory: Arc<dyn IdentityDirectory>,
    attendance: Arc<AttendanceGate>,
    matcher: EuclideanMatcher,
    threshold: f32,
}

impl RecognitionService {
    pub fn new(
        pipeline: Arc<FacePipeline>,
        signatures: Arc<dyn SignatureStore>,
        directory: Arc<dyn IdentityDirectory>,
        attendance: Arc<AttendanceGate>,
        threshold: f32,
    ) -> Self {
        Self {
            pipeline,
            signatures,
            directory,
            attendance,
            matcher: EuclideanMatcher,
            threshold,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Identify the primary face in `input` and mark attendance for `today`.
    pub fn recognize(
        &self,
        input: ImageInput,
        today: NaiveDate,
    ) -> Result<RecognitionOutcome, RecognitionError> {
        let raster = match decode_input(input) {
            Ok(raster) => raster,
            Err(err) => {
                tracing::debug!(error = %err, "recognize: undecodable image");
                return Ok(RecognitionOutcome::TryAgain(RetryReason::InvalidImage {
                    message: err.to_string(),
                }));
            }
        };

        let faces = self.pipeline.detect(&raster)?;
        let Some(face) = select_primary(&faces, raster.width(), raster.height()) else {
            tracing::debug!("recognize: no face detected");
            return Ok(RecognitionOutcome::TryAgain(RetryReason::NoFaceDetected));
        };
        if faces.len() > 1 {
            tracing::debug!(count = faces.len(), "recognize: using primary face");
        }

        let probe = self.pipeline.extract(&raster, face)?;
        let gallery = self.signatures.scan()?;
        let outcome = self.matcher.compare(&probe, gallery, self.threshold)?;

        match outcome {
            MatchOutcome::NoRegisteredIdentities => Ok(RecognitionOutcome::NoRegisteredIdentities),
            MatchOutcome::NoMatch { best_confidence } => {
                tracing::info!(best_confidence, threshold = self.threshold, "face not recognized");
                Ok(RecognitionOutcome::NotRecognized { best_confidence })
            }
            MatchOutcome::Match {
                identity,
                confidence,
                distance,
            } => {
                let identity =
                    IdentityKey::parse(&identity).map_err(|err| StoreError::Corrupt {
                        path: self.signatures.root().to_path_buf(),
                        message: err.to_string(),
                    })?;
                tracing::info!(identity = %identity, confidence, distance, "face recognized");

                // Resolve the name before writing, so a failed lookup records nothing.
                let display_name = self.directory.display_name(&identity)?;
                let attendance = self.attendance.record(&identity, today, confidence)?;
                Ok(RecognitionOutcome::Recognized {
                    identity,
                    display_name,
                    confidence,
                    attendance,
                })
            }
        }
    }

    /// The attendance register for `date`, newest first.
    pub fn attendance_on(&self, date: NaiveDate) -> Result<Vec<AttendanceEvent>, AttendanceError> {
        self.attendance.on_date(date)
    }
}
