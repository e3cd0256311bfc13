use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use rollcall_core::{
    ArcFaceExtractor, DetectorError, DetectorOptions, ExtractorError, FaceDetector, ImageInput,
    ScrfdDetector, SignatureExtractor,
};
use serde::Serialize;
use thiserror::Error;

use crate::attendance::{
    AttendanceError, AttendanceEvent, AttendanceGate, SqliteAttendanceRepository,
};
use crate::config::{ConfigError, EngineConfig};
use crate::enrollment::{EnrollmentError, EnrollmentRecord, EnrollmentService, RemovalOutcome};
use crate::errors::StoreError;
use crate::identity::{IdentityKey, SqliteIdentityDirectory};
use crate::photos::PhotoStore;
use crate::pipeline::FacePipeline;
use crate::recognition::{RecognitionError, RecognitionOutcome, RecognitionService};
use crate::store::{FileSignatureStore, SignatureStore};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("extractor error: {0}")]
    Extractor(#[from] ExtractorError),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("attendance storage error: {0}")]
    Attendance(#[from] AttendanceError),
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
    #[error(transparent)]
    Recognition(#[from] RecognitionError),
    #[error("engine worker failed: {0}")]
    WorkerFailed(#[from] tokio::task::JoinError),
}

/// Snapshot of the engine's configuration and gallery size.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub enrolled: usize,
    pub confidence_threshold: f32,
    pub data_dir: PathBuf,
    pub signature_dir: PathBuf,
    pub photo_dir: PathBuf,
    pub db_path: PathBuf,
    pub detector_model: PathBuf,
    pub extractor_model: PathBuf,
}

/// Enrollment and recognition wired to one data directory.
pub struct Engine {
    config: EngineConfig,
    signatures: Arc<dyn SignatureStore>,
    enrollment: EnrollmentService,
    recognition: RecognitionService,
}

impl Engine {
    /// Load both ONNX models and open storage under `config.data_dir`.
    /// Fails fast if any model or store is unavailable.
    pub fn initialize(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let detector_path = config.detector_model_path();
        let detector = ScrfdDetector::load(
            &detector_path,
            DetectorOptions {
                min_face_size: config.min_face_size,
                intra_threads: config.inference_threads,
                ..DetectorOptions::default()
            },
        )?;
        tracing::info!(path = %detector_path.display(), "SCRFD detector loaded");

        let extractor_path = config.extractor_model_path();
        let extractor = ArcFaceExtractor::load(&extractor_path, config.inference_threads)?;
        tracing::info!(path = %extractor_path.display(), "ArcFace extractor loaded");

        Self::with_components(config, Box::new(detector), Box::new(extractor))
    }

    /// Open storage under `config.data_dir` around caller-supplied models.
    pub fn with_components(
        config: EngineConfig,
        detector: Box<dyn FaceDetector>,
        extractor: Box<dyn SignatureExtractor>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let signatures = Arc::new(FileSignatureStore::open(config.signature_dir())?);
        Self::with_signature_store(config, FacePipeline::new(detector, extractor), signatures)
    }

    /// Like [`with_components`](Self::with_components) with a caller-supplied
    /// signature store.
    pub fn with_signature_store(
        config: EngineConfig,
        pipeline: FacePipeline,
        signatures: Arc<dyn SignatureStore>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)
            .map_err(|source| StoreError::io(&config.data_dir, source))?;

        let db_path = config.db_path();
        let photos = PhotoStore::open(
            config.photo_dir(),
            config.photo_max_dimension,
            config.photo_quality,
            config.min_face_size,
        )?;
        let directory = Arc::new(SqliteIdentityDirectory::open(&db_path)?);
        let attendance = Arc::new(AttendanceGate::new(Arc::new(
            SqliteAttendanceRepository::open(&db_path)?,
        )));
        let pipeline = Arc::new(pipeline);

        let enrollment = EnrollmentService::new(
            Arc::clone(&pipeline),
            Arc::clone(&signatures),
            photos,
            directory.clone(),
            Arc::clone(&attendance),
        );
        let recognition = RecognitionService::new(
            pipeline,
            Arc::clone(&signatures),
            directory,
            attendance,
            config.confidence_threshold,
        );

        tracing::info!(
            data_dir = %config.data_dir.display(),
            threshold = config.confidence_threshold,
            "engine ready"
        );
        Ok(Self {
            config,
            signatures,
            enrollment,
            recognition,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn enrollment(&self) -> &EnrollmentService {
        &self.enrollment
    }

    pub fn recognition(&self) -> &RecognitionService {
        &self.recognition
    }

    pub fn status(&self) -> Result<EngineStatus, EngineError> {
        Ok(EngineStatus {
            enrolled: self.signatures.len()?,
            confidence_threshold: self.config.confidence_threshold,
            data_dir: self.config.data_dir.clone(),
            signature_dir: self.signatures.root().to_path_buf(),
            photo_dir: self.config.photo_dir(),
            db_path: self.config.db_path(),
            detector_model: self.config.detector_model_path(),
            extractor_model: self.config.extractor_model_path(),
        })
    }

    pub fn into_handle(self) -> EngineHandle {
        EngineHandle {
            engine: Arc::new(self),
        }
    }
}

/// Clone-safe async handle. Every call runs on the blocking pool so image
/// decoding and inference never stall the runtime.
#[derive(Clone)]
pub struct EngineHandle {
    engine: Arc<Engine>,
}

impl EngineHandle {
    async fn run<T, F>(&self, op: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&Engine) -> Result<T, EngineError> + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || op(&engine)).await?
    }

    pub async fn enroll(
        &self,
        key: String,
        display_name: Option<String>,
        input: ImageInput,
    ) -> Result<EnrollmentRecord, EngineError> {
        self.run(move |engine| {
            let record = match display_name.as_deref() {
                Some(name) => engine.enrollment.enroll_named(&key, name, input)?,
                None => engine.enrollment.enroll(&key, input)?,
            };
            Ok(record)
        })
        .await
    }

    pub async fn recognize(
        &self,
        input: ImageInput,
        today: NaiveDate,
    ) -> Result<RecognitionOutcome, EngineError> {
        self.run(move |engine| Ok(engine.recognition.recognize(input, today)?))
            .await
    }

    pub async fn remove(&self, key: String) -> Result<RemovalOutcome, EngineError> {
        self.run(move |engine| Ok(engine.enrollment.remove(&key)?))
            .await
    }

    pub async fn enrolled(&self) -> Result<Vec<IdentityKey>, EngineError> {
        self.run(|engine| Ok(engine.enrollment.enrolled()?)).await
    }

    pub async fn attendance_on(&self, date: NaiveDate) -> Result<Vec<AttendanceEvent>, EngineError> {
        self.run(move |engine| Ok(engine.recognition.attendance_on(date)?))
            .await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.run(|engine| engine.status()).await
    }
}
