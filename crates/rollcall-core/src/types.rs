use serde::{Deserialize, Serialize};

/// Axis-aligned face bounding box in raster pixels, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl FaceRegion {
    /// Clip the region so it lies fully inside a `width` x `height` raster.
    ///
    /// Regions entirely outside the raster collapse to zero area at the nearest edge.
    pub fn clamp_to(&self, width: u32, height: u32) -> FaceRegion {
        let (w, h) = (width as f32, height as f32);
        let x1 = self.x.clamp(0.0, w);
        let y1 = self.y.clamp(0.0, h);
        let x2 = (self.x + self.width.max(0.0)).clamp(x1, w);
        let y2 = (self.y + self.height.max(0.0)).clamp(y1, h);

        FaceRegion {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: self.confidence,
            landmarks: self.landmarks,
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Fixed-length face signature used for distance-based identity comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub values: Vec<f32>,
    /// Model version that produced this signature (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Signature {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance between two signatures of equal length.
    pub fn distance(&self, other: &Signature) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Convert a signature distance into a confidence score in [0, 1].
pub fn confidence_from_distance(distance: f32) -> f32 {
    (1.0 - distance).clamp(0.0, 1.0)
}

/// Result of matching a probe signature against the enrolled gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// Nearest candidate is within the confidence threshold.
    Match {
        identity: String,
        confidence: f32,
        distance: f32,
    },
    /// Nearest candidate exists but falls below the threshold.
    NoMatch { best_confidence: f32 },
    /// The gallery was empty.
    NoRegisteredIdentities,
}

impl MatchOutcome {
    pub fn identity(&self) -> Option<&str> {
        match self {
            MatchOutcome::Match { identity, .. } => Some(identity),
            _ => None,
        }
    }
}

/// Strategy for comparing a probe signature against a gallery of enrolled signatures.
///
/// The gallery is consumed lazily; an error yielded by it aborts the comparison
/// and is returned unchanged.
pub trait Matcher {
    fn compare<I, E>(&self, probe: &Signature, gallery: I, threshold: f32) -> Result<MatchOutcome, E>
    where
        I: IntoIterator<Item = Result<(String, Signature), E>>;
}

/// Nearest-neighbour matcher over Euclidean distance.
///
/// Ties at the minimum distance resolve to the lexicographically smallest identity key.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare<I, E>(&self, probe: &Signature, gallery: I, threshold: f32) -> Result<MatchOutcome, E>
    where
        I: IntoIterator<Item = Result<(String, Signature), E>>,
    {
        let mut best: Option<(String, f32)> = None;
        let mut seen = 0usize;

        for entry in gallery {
            let (identity, candidate) = entry?;
            seen += 1;

            if candidate.len() != probe.len() {
                tracing::warn!(
                    identity = %identity,
                    expected = probe.len(),
                    found = candidate.len(),
                    "skipping signature with mismatched length"
                );
                continue;
            }

            let distance = probe.distance(&candidate);
            let is_better = match &best {
                None => true,
                Some((best_id, best_distance)) => {
                    distance < *best_distance
                        || (distance == *best_distance && identity < *best_id)
                }
            };
            if is_better {
                best = Some((identity, distance));
            }
        }

        if seen == 0 {
            return Ok(MatchOutcome::NoRegisteredIdentities);
        }

        Ok(match best {
            Some((identity, distance)) => {
                let confidence = confidence_from_distance(distance);
                // Decide in distance space: 1 - (1 - t) can round below t.
                if distance <= 1.0 - threshold {
                    MatchOutcome::Match {
                        identity,
                        confidence,
                        distance,
                    }
                } else {
                    MatchOutcome::NoMatch {
                        best_confidence: confidence,
                    }
                }
            }
            // Every candidate had a different length.
            None => MatchOutcome::NoMatch {
                best_confidence: 0.0,
            },
        })
    }
}
