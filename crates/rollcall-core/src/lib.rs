//! rollcall-core: face signature engine.
//!
//! Decodes uploaded images, detects faces with SCRFD, derives ArcFace
//! signatures and matches them by Euclidean distance. Detection and
//! extraction sit behind the [`FaceDetector`] and [`SignatureExtractor`]
//! traits so callers can substitute their own models.

pub mod alignment;
pub mod decoder;
pub mod detector;
pub mod recognizer;
pub mod types;

pub use decoder::{decode, decode_data_uri, decode_input, DecodeError, ImageInput, Raster};
pub use detector::{DetectorError, DetectorOptions, FaceDetector, ScrfdDetector};
pub use recognizer::{ArcFaceExtractor, ExtractorError, SignatureExtractor};
pub use types::{confidence_from_distance, EuclideanMatcher, FaceRegion, MatchOutcome, Matcher, Signature};

/// Default threshold on `1 - distance` for accepting a match.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.6;

/// Model file names expected inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
pub const EXTRACTOR_MODEL_FILE: &str = "w600k_r50.onnx";
