//! Enrollment: one photo in, one durable signature (plus photo) out.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rollcall_core::{decode_input, DecodeError, FaceRegion, ImageInput, Raster, Signature};
use serde::Serialize;
use thiserror::Error;

use crate::attendance::{AttendanceError, AttendanceGate};
use crate::errors::StoreError;
use crate::identity::{IdentityDirectory, IdentityKey, InvalidIdentityKey};
use crate::locks::KeyedLocks;
use crate::photos::PhotoStore;
use crate::pipeline::{FacePipeline, InferenceError};
use crate::store::SignatureStore;

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error(transparent)]
    InvalidIdentityKey(#[from] InvalidIdentityKey),
    #[error("invalid image: {0}")]
    InvalidImage(#[from] DecodeError),
    #[error("no face detected in the photo")]
    NoFaceDetected,
    #[error("expected exactly one face, found {count}")]
    MultipleFacesDetected { count: usize },
    #[error("inference failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("storage failure: {0}")]
    StorageFailure(#[from] StoreError),
    #[error("attendance storage failure: {0}")]
    Attendance(#[from] AttendanceError),
}

/// What a successful enrollment left on disk.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentRecord {
    pub identity: IdentityKey,
    pub display_name: Option<String>,
    pub signature_len: usize,
    pub signature_path: PathBuf,
    pub photo_path: PathBuf,
    pub enrolled_at: DateTime<Utc>,
    /// True when an earlier enrollment for the same key was replaced.
    pub superseded: bool,
}

/// What [`EnrollmentService::remove`] found and deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovalOutcome {
    pub identity: IdentityKey,
    pub signature_removed: bool,
    pub photo_removed: bool,
    pub directory_entry_removed: bool,
    pub attendance_events_removed: usize,
}

impl RemovalOutcome {
    pub fn existed(&self) -> bool {
        self.signature_removed || self.photo_removed || self.directory_entry_removed
    }
}

pub struct EnrollmentService {
    pipeline: Arc<FacePipeline>,
    signatures: Arc<dyn SignatureStore>,
    photos: PhotoStore,
    directory: Arc<dyn IdentityDirectory>,
    attendance: Arc<AttendanceGate>,
    locks: KeyedLocks,
}

impl EnrollmentService {
    pub fn new(
        pipeline: Arc<FacePipeline>,
        signatures: Arc<dyn SignatureStore>,
        photos: PhotoStore,
        directory: Arc<dyn IdentityDirectory>,
        attendance: Arc<AttendanceGate>,
    ) -> Self {
        Self {
            pipeline,
            signatures,
            photos,
            directory,
            attendance,
            locks: KeyedLocks::new(),
        }
    }

    /// Enroll `key` from a photo containing exactly one face. Replaces any
    /// previous enrollment for the key.
    pub fn enroll(&self, key: &str, input: ImageInput) -> Result<EnrollmentRecord, EnrollmentError> {
        self.enroll_inner(key, None, input)
    }

    /// Like [`enroll`](Self::enroll), then records `display_name` in the
    /// identity directory.
    pub fn enroll_named(
        &self,
        key: &str,
        display_name: &str,
        input: ImageInput,
    ) -> Result<EnrollmentRecord, EnrollmentError> {
        self.enroll_inner(key, Some(display_name), input)
    }

    fn enroll_inner(
        &self,
        key: &str,
        display_name: Option<&str>,
        input: ImageInput,
    ) -> Result<EnrollmentRecord, EnrollmentError> {
        let identity = IdentityKey::parse(key)?;
        let raster = decode_input(input)?;

        let faces = self.pipeline.detect(&raster)?;
        let face = match faces.as_slice() {
            [] => return Err(EnrollmentError::NoFaceDetected),
            [face] => face,
            many => {
                return Err(EnrollmentError::MultipleFacesDetected { count: many.len() });
            }
        };
        let signature = self.pipeline.extract(&raster, face)?;

        let record = self.locks.with_lock(identity.as_str(), || {
            let Some(name) = display_name else {
                return self.persist(&identity, &raster, face, &signature);
            };

            // Directory first, restored if persisting fails.
            let previous_name = self.directory.display_name(&identity)?;
            self.directory.upsert(&identity, name)?;
            match self.persist(&identity, &raster, face, &signature) {
                Ok(mut record) => {
                    record.display_name = Some(name.to_string());
                    Ok(record)
                }
                Err(err) => {
                    self.restore_display_name(&identity, previous_name);
                    Err(err)
                }
            }
        })?;

        tracing::info!(
            identity = %identity,
            dimension = record.signature_len,
            superseded = record.superseded,
            "identity enrolled"
        );
        Ok(record)
    }

    /// Stage the photo, write the signature, then commit the photo. A failure
    /// at any step leaves the previous enrollment (or nothing) in place.
    fn persist(
        &self,
        identity: &IdentityKey,
        raster: &Raster,
        face: &FaceRegion,
        signature: &Signature,
    ) -> Result<EnrollmentRecord, StoreError> {
        let staged = self.photos.stage(raster, face)?;

        let previous = match self.signatures.get(identity) {
            Ok(previous) => previous,
            Err(StoreError::Corrupt { path, message }) => {
                tracing::warn!(
                    identity = %identity,
                    path = %path.display(),
                    %message,
                    "replacing corrupt signature"
                );
                None
            }
            Err(err) => return Err(err),
        };
        let superseded = previous.is_some() || self.photos.exists(identity);

        self.signatures.put(identity, signature)?;

        let photo_path = match self.photos.commit(staged, identity) {
            Ok(path) => path,
            Err(err) => {
                self.restore_signature(identity, previous);
                return Err(err);
            }
        };

        Ok(EnrollmentRecord {
            identity: identity.clone(),
            display_name: None,
            signature_len: signature.len(),
            signature_path: self.signatures.location(identity),
            photo_path,
            enrolled_at: Utc::now(),
            superseded,
        })
    }

    fn restore_display_name(&self, identity: &IdentityKey, previous: Option<String>) {
        let restored = match previous {
            Some(previous) => self.directory.upsert(identity, &previous),
            None => self.directory.remove(identity).map(|_| ()),
        };
        if let Err(err) = restored {
            tracing::error!(
                identity = %identity,
                error = %err,
                "failed to roll back display name after enrollment failure"
            );
        }
    }

    fn restore_signature(&self, identity: &IdentityKey, previous: Option<Signature>) {
        let restored = match previous {
            Some(previous) => self.signatures.put(identity, &previous),
            None => self.signatures.delete(identity).map(|_| ()),
        };
        if let Err(err) = restored {
            tracing::error!(
                identity = %identity,
                error = %err,
                "failed to roll back signature after photo commit failure"
            );
        }
    }

    /// Delete everything held for `key`: signature, photo, directory entry and
    /// attendance history. Removing an unknown key succeeds and reports nothing.
    pub fn remove(&self, key: &str) -> Result<RemovalOutcome, EnrollmentError> {
        let identity = IdentityKey::parse(key)?;

        let outcome = self.locks.with_lock(identity.as_str(), || {
            let signature_removed = self.signatures.delete(&identity)?;
            let photo_removed = self.photos.delete(&identity)?;
            let directory_entry_removed = self.directory.remove(&identity)?;
            let attendance_events_removed = self.attendance.remove_identity(&identity)?;
            Ok::<_, EnrollmentError>(RemovalOutcome {
                identity: identity.clone(),
                signature_removed,
                photo_removed,
                directory_entry_removed,
                attendance_events_removed,
            })
        })?;

        if outcome.existed() {
            tracing::info!(
                identity = %identity,
                attendance_events = outcome.attendance_events_removed,
                "identity removed"
            );
        } else {
            tracing::debug!(identity = %identity, "remove: identity not enrolled");
        }
        Ok(outcome)
    }

    /// Enrolled identity keys in ascending order.
    pub fn enrolled(&self) -> Result<Vec<IdentityKey>, StoreError> {
        self.signatures.keys()
    }
}
