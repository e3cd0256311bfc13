//! Signature extraction.
//!
//! [`ArcFaceExtractor`] produces 512-dimensional signatures with the w600k_r50
//! ArcFace model. Embeddings are L2-normalized and then scaled by
//! [`SIGNATURE_SCALE`], so the Euclidean distance between two signatures is
//! `sqrt(2 - 2·cos) / (2·sqrt(2))` and `confidence = 1 - distance` stays in
//! [0.29, 1]. At the default threshold of 0.6 a match requires cosine ≥ 0.36.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::decoder::Raster;
use crate::types::{FaceRegion, Signature};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric normalization, unlike SCRFD's 128.0
pub const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

/// 1 / (2·sqrt(2)): maps unit-norm embeddings onto distances in [0, 0.7071].
pub const SIGNATURE_SCALE: f32 = 0.353_553_38;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("model file not found: {0} (download w600k_r50.onnx from insightface)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face region is empty")]
    EmptyRegion,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns one detected face into a fixed-length signature.
///
/// Identical (raster, region) input must produce an identical signature.
pub trait SignatureExtractor: Send {
    fn extract(&mut self, raster: &Raster, region: &FaceRegion) -> Result<Signature, ExtractorError>;
}

/// ArcFace-based signature extractor.
pub struct ArcFaceExtractor {
    session: Session,
}

impl ArcFaceExtractor {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, ExtractorError> {
        if !model_path.exists() {
            return Err(ExtractorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Convert a 112×112 RGB crop into a NCHW float tensor.
    fn preprocess(face: &[u8]) -> Array4<f32> {
        let size = ALIGNED_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for y in 0..size {
            for x in 0..size {
                let base = (y * size + x) * 3;
                for c in 0..3 {
                    let pixel = face.get(base + c).copied().unwrap_or(0) as f32;
                    tensor[[0, c, y, x]] = (pixel - ARCFACE_MEAN) / ARCFACE_STD;
                }
            }
        }

        tensor
    }
}

impl SignatureExtractor for ArcFaceExtractor {
    fn extract(&mut self, raster: &Raster, region: &FaceRegion) -> Result<Signature, ExtractorError> {
        if region.area() <= 0.0 {
            return Err(ExtractorError::EmptyRegion);
        }

        let face = alignment::normalize_face(raster, region);
        let input = Self::preprocess(&face);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractorError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(ExtractorError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Signature {
            values: scale_embedding(raw),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }
}

/// L2-normalize and apply [`SIGNATURE_SCALE`]. A zero vector stays zero.
fn scale_embedding(raw: &[f32]) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm * SIGNATURE_SCALE).collect()
    } else {
        raw.to_vec()
    }
}
