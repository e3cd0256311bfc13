use std::sync::{Mutex, PoisonError};

use rollcall_core::{
    DetectorError, ExtractorError, FaceDetector, FaceRegion, Raster, Signature, SignatureExtractor,
};
use thiserror::Error;

/// Model failure while processing an image. Distinct from "no face": the
/// detector and extractor only report these when inference itself breaks.
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("extractor error: {0}")]
    Extractor(#[from] ExtractorError),
}

/// Detector and extractor shared by every worker. Each session needs `&mut`,
/// so calls into the same model are serialized.
pub struct FacePipeline {
    detector: Mutex<Box<dyn FaceDetector>>,
    extractor: Mutex<Box<dyn SignatureExtractor>>,
}

impl FacePipeline {
    pub fn new(detector: Box<dyn FaceDetector>, extractor: Box<dyn SignatureExtractor>) -> Self {
        Self {
            detector: Mutex::new(detector),
            extractor: Mutex::new(extractor),
        }
    }

    pub fn detect(&self, raster: &Raster) -> Result<Vec<FaceRegion>, InferenceError> {
        let mut detector = self.detector.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(detector.detect(raster)?)
    }

    pub fn extract(&self, raster: &Raster, region: &FaceRegion) -> Result<Signature, InferenceError> {
        let mut extractor = self.extractor.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(extractor.extract(raster, region)?)
    }
}

/// Pick the face a recognition request is about: largest area, then closest
/// to the raster centre, then earliest in detector order.
pub fn select_primary(regions: &[FaceRegion], width: u32, height: u32) -> Option<&FaceRegion> {
    let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
    let centre_distance = |region: &FaceRegion| {
        let (x, y) = region.center();
        (x - cx).powi(2) + (y - cy).powi(2)
    };

    let mut best: Option<&FaceRegion> = None;
    for region in regions {
        let better = match best {
            None => true,
            Some(current) => {
                let (area, current_area) = (region.area(), current.area());
                area > current_area
                    || (area == current_area && centre_distance(region) < centre_distance(current))
            }
        };
        if better {
            best = Some(region);
        }
    }
    best
}
