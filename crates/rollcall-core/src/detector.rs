//! Face detection.
//!
//! [`FaceDetector`] is the seam the services depend on. [`ScrfdDetector`] implements
//! it with the SCRFD (Sample and Computation Redistribution for Efficient Face
//! Detection) model: 3-stride anchor-free decoding, NMS, and a minimum face size
//! filter applied in the letterboxed input space.

use crate::decoder::Raster;
use crate::types::FaceRegion;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

pub const DEFAULT_MIN_FACE_SIZE: f32 = 80.0;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download det_10g.onnx from insightface)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locates faces in a raster.
///
/// Implementations return an empty vector when no face is present and must
/// return regions in a stable order for identical input. Every returned region
/// lies inside the raster.
pub trait FaceDetector: Send {
    fn detect(&mut self, raster: &Raster) -> Result<Vec<FaceRegion>, DetectorError>;
}

/// Tunables for [`ScrfdDetector`].
#[derive(Debug, Clone)]
pub struct DetectorOptions {
    /// Smallest accepted face side, in pixels of the 640×640 letterboxed input.
    pub min_face_size: f32,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    pub intra_threads: usize,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            min_face_size: DEFAULT_MIN_FACE_SIZE,
            confidence_threshold: SCRFD_CONFIDENCE_THRESHOLD,
            nms_threshold: SCRFD_NMS_THRESHOLD,
            intra_threads: 2,
        }
    }
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    options: DetectorOptions,
    /// Per-stride output indices [(score, bbox, kps)] for strides [8, 16, 32].
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path, options: DetectorOptions) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(options.intra_threads)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            min_face_size = options.min_face_size,
            "loaded SCRFD model"
        );

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            options,
            stride_indices,
        })
    }
}

impl FaceDetector for ScrfdDetector {
    /// Detect faces, returning regions sorted by descending confidence.
    fn detect(&mut self, raster: &Raster) -> Result<Vec<FaceRegion>, DetectorError> {
        let (input, letterbox) = preprocess(raster);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all_detections = Vec::new();

        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[kps_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("kps stride {stride}: {e}")))?;

            all_detections.extend(decode_stride(
                StrideOutputs { scores, bboxes, kps },
                stride,
                &letterbox,
                self.options.confidence_threshold,
            ));
        }

        let min_side = self.options.min_face_size / letterbox.scale;
        let decoded = all_detections.len();
        all_detections.retain(|d| d.width >= min_side && d.height >= min_side);

        let regions: Vec<FaceRegion> = nms(all_detections, self.options.nms_threshold)
            .into_iter()
            .map(|d| d.clamp_to(raster.width(), raster.height()))
            .collect();

        tracing::debug!(
            decoded,
            kept = regions.len(),
            min_side,
            "SCRFD detection complete"
        );

        Ok(regions)
    }
}

/// Letterbox an RGB raster into a 640×640 NCHW float tensor.
///
/// Resizes with bilinear interpolation, pads with the mean (normalizes to 0.0).
fn preprocess(raster: &Raster) -> (Array4<f32>, LetterboxInfo) {
    let width = raster.width() as usize;
    let height = raster.height() as usize;
    let size = SCRFD_INPUT_SIZE;

    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
    let new_w = ((width as f32 * scale).round() as usize).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as usize).clamp(1, size);
    let pad_x = (size - new_w) as f32 / 2.0;
    let pad_y = (size - new_h) as f32 / 2.0;

    let letterbox = LetterboxInfo { scale, pad_x, pad_y };

    let pad_x_start = pad_x.floor() as usize;
    let pad_y_start = pad_y.floor() as usize;
    let inv_scale = 1.0 / scale;

    // Padding pixels stay at 0.0, i.e. the normalized mean.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * inv_scale - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * inv_scale - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = raster.pixel(x0, y0);
            let tr = raster.pixel(x1, y0);
            let bl = raster.pixel(x0, y1);
            let br = raster.pixel(x1, y1);

            for c in 0..3 {
                let val = tl[c] as f32 * (1.0 - fx) * (1.0 - fy)
                    + tr[c] as f32 * fx * (1.0 - fy)
                    + bl[c] as f32 * (1.0 - fx) * fy
                    + br[c] as f32 * fx * fy;
                let pixel = val.round().clamp(0.0, 255.0);
                tensor[[0, c, y + pad_y_start, x + pad_x_start]] = (pixel - SCRFD_MEAN) / SCRFD_STD;
            }
        }
    }

    (tensor, letterbox)
}

/// Discover output tensor ordering by name.
///
/// SCRFD exports either name tensors "score_8", "bbox_16", ... or use generic
/// numeric names. Unrecognized names fall back to the standard positional order:
///   [0-2] = scores, [3-5] = bboxes, [6-8] = kps (strides 8, 16, 32)
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?)))
        .collect();

    match named {
        Some(indices) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [indices[0], indices[1], indices[2]]
        }
        None => {
            tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Raw output slices for one stride level.
struct StrideOutputs<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

/// Decode detections for a single stride level into raster coordinates.
fn decode_stride(
    outputs: StrideOutputs<'_>,
    stride: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<FaceRegion> {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let grid_h = SCRFD_INPUT_SIZE / stride;
    let num_anchors = grid_h * grid_w * SCRFD_ANCHORS_PER_CELL;
    let stride_f = stride as f32;

    let unmap = |x: f32, y: f32| -> (f32, f32) {
        (
            (x - letterbox.pad_x) / letterbox.scale,
            (y - letterbox.pad_y) / letterbox.scale,
        )
    };

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = outputs.scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid_w) as f32 * stride_f;
        let anchor_cy = (anchor_idx / grid_w) as f32 * stride_f;

        // [x1_offset, y1_offset, x2_offset, y2_offset] * stride
        let Some(offsets) = outputs.bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };
        let (x1, y1) = unmap(anchor_cx - offsets[0] * stride_f, anchor_cy - offsets[1] * stride_f);
        let (x2, y2) = unmap(anchor_cx + offsets[2] * stride_f, anchor_cy + offsets[3] * stride_f);

        let landmarks = outputs.kps.get(idx * 10..idx * 10 + 10).map(|kps| {
            std::array::from_fn(|i| {
                unmap(
                    anchor_cx + kps[i * 2] * stride_f,
                    anchor_cy + kps[i * 2 + 1] * stride_f,
                )
            })
        });

        detections.push(FaceRegion {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }

    detections
}

/// Non-Maximum Suppression, sorted by descending confidence.
///
/// The sort is stable, so equal-confidence detections keep decode order.
fn nms(mut detections: Vec<FaceRegion>, iou_threshold: f32) -> Vec<FaceRegion> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<FaceRegion> = Vec::new();
    for candidate in detections {
        if keep.iter().all(|kept| iou(kept, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Intersection-over-Union between two regions.
fn iou(a: &FaceRegion, b: &FaceRegion) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union_area = a.area() + b.area() - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}
