//! Face alignment via 4-DOF similarity transform.
//!
//! Aligns detected faces to a canonical 112×112 RGB crop using the five
//! InsightFace reference landmarks and least-squares estimation. Regions
//! without landmarks fall back to a square crop around the box.

use crate::decoder::Raster;
use crate::types::FaceRegion;

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: usize = 112;
const CHANNELS: usize = 3;

/// Estimate a 2×3 similarity transform (4-DOF: scale, rotation, translation)
/// from `src` landmarks to `dst` landmarks using least-squares.
///
/// Returns [a, -b, tx, b, a, ty] representing the matrix:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> [f32; 6] {
    // Normal equations for A * [a, b, tx, ty]^T = B, two rows per point:
    //   sx * a - sy * b + tx = dx
    //   sy * a + sx * b + ty = dy
    let mut ata = [0.0f32; 16];
    let mut atb = [0.0f32; 4];

    for ((sx, sy), (dx, dy)) in src.iter().copied().zip(dst.iter().copied()) {
        let r1 = [sx, -sy, 1.0, 0.0];
        let r2 = [sy, sx, 0.0, 1.0];

        for j in 0..4 {
            for k in 0..4 {
                ata[j * 4 + k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * dx + r2[j] * dy;
        }
    }

    let [a, b, tx, ty] = solve_4x4(&ata, &atb);
    [a, -b, tx, b, a, ty]
}

/// Solve a 4×4 linear system via Gaussian elimination with partial pivoting.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: &[f32; 16], atb: &[f32; 4]) -> [f32; 4] {
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        for j in 0..4 {
            m[i][j] = ata[i * 4 + j];
        }
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let mut max_row = col;
        let mut max_val = m[col][col].abs();
        for row in (col + 1)..4 {
            if m[row][col].abs() > max_val {
                max_val = m[row][col].abs();
                max_row = row;
            }
        }
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            // Degenerate landmarks: identity scale, no translation.
            return [1.0, 0.0, 0.0, 0.0];
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }

    x
}

/// Bilinear sample of one RGB pixel; out-of-bounds reads are black.
fn sample_bilinear(raster: &Raster, sx: f32, sy: f32) -> [f32; 3] {
    let (w, h) = (raster.width() as i32, raster.height() as i32);
    let x0 = sx.floor() as i32;
    let y0 = sy.floor() as i32;
    let fx = sx - x0 as f32;
    let fy = sy - y0 as f32;

    let fetch = |x: i32, y: i32| -> [f32; 3] {
        if x >= 0 && x < w && y >= 0 && y < h {
            let [r, g, b] = raster.pixel(x as usize, y as usize);
            [r as f32, g as f32, b as f32]
        } else {
            [0.0; 3]
        }
    };

    let tl = fetch(x0, y0);
    let tr = fetch(x0 + 1, y0);
    let bl = fetch(x0, y0 + 1);
    let br = fetch(x0 + 1, y0 + 1);

    std::array::from_fn(|c| {
        tl[c] * (1.0 - fx) * (1.0 - fy)
            + tr[c] * fx * (1.0 - fy)
            + bl[c] * (1.0 - fx) * fy
            + br[c] * fx * fy
    })
}

/// Apply a 2×3 similarity warp to produce an `out_size`² RGB crop.
fn warp_affine(raster: &Raster, matrix: &[f32; 6], out_size: usize) -> Vec<u8> {
    let (a, tx) = (matrix[0], matrix[2]);
    let (b, ty) = (matrix[3], matrix[5]);

    let mut output = vec![0u8; out_size * out_size * CHANNELS];

    // M = [[a, -b], [b, a]], det = a^2 + b^2
    let det = a * a + b * b;
    if det.abs() < 1e-12 {
        return output;
    }
    let ia = a / det;
    let ib = b / det;

    for oy in 0..out_size {
        for ox in 0..out_size {
            // src = M_inv * (dst - t)
            let dx = ox as f32 - tx;
            let dy = oy as f32 - ty;
            let sx = ia * dx + ib * dy;
            let sy = -ib * dx + ia * dy;

            let rgb = sample_bilinear(raster, sx, sy);
            let base = (oy * out_size + ox) * CHANNELS;
            for c in 0..CHANNELS {
                output[base + c] = rgb[c].round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    output
}

/// Align a face with landmarks to a canonical 112×112 RGB crop.
pub fn align_face(raster: &Raster, landmarks: &[(f32, f32); 5]) -> Vec<u8> {
    let matrix = estimate_similarity_transform(landmarks, &REFERENCE_LANDMARKS_112);
    warp_affine(raster, &matrix, ALIGNED_SIZE)
}

/// Resize a square crop centred on `region` to 112×112 RGB.
///
/// Used when the detector provides no landmarks.
pub fn crop_face(raster: &Raster, region: &FaceRegion) -> Vec<u8> {
    let side = region.width.max(region.height).max(1.0);
    let (cx, cy) = region.center();
    let scale = side / ALIGNED_SIZE as f32;
    let left = cx - side / 2.0;
    let top = cy - side / 2.0;

    // Pure scale + translation expressed in the same form as the similarity warp.
    let a = 1.0 / scale;
    let matrix = [a, 0.0, -left * a, 0.0, a, -top * a];
    warp_affine(raster, &matrix, ALIGNED_SIZE)
}

/// Produce the 112×112 RGB crop used for signature extraction.
pub fn normalize_face(raster: &Raster, region: &FaceRegion) -> Vec<u8> {
    match region.landmarks.as_ref() {
        Some(landmarks) => align_face(raster, landmarks),
        None => crop_face(raster, region),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(width: u32, height: u32, value: u8) -> Raster {
        Raster::from_rgb(width, height, vec![value; (width * height * 3) as usize]).unwrap()
    }

    #[test]
    fn test_identity_transform() {
        let pts = REFERENCE_LANDMARKS_112;
        let m = estimate_similarity_transform(&pts, &pts);

        assert!((m[0] - 1.0).abs() < 1e-4, "a = {}", m[0]);
        assert!(m[1].abs() < 1e-4, "-b = {}", m[1]);
        assert!(m[2].abs() < 1e-3, "tx = {}", m[2]);
        assert!(m[3].abs() < 1e-4, "b = {}", m[3]);
        assert!((m[4] - 1.0).abs() < 1e-4, "a2 = {}", m[4]);
        assert!(m[5].abs() < 1e-3, "ty = {}", m[5]);
    }

    #[test]
    fn test_scaled_transform() {
        // Landmarks at 2x scale → a ≈ 0.5
        let src: [(f32, f32); 5] = std::array::from_fn(|i| {
            let (x, y) = REFERENCE_LANDMARKS_112[i];
            (x * 2.0, y * 2.0)
        });
        let m = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112);
        assert!((m[0] - 0.5).abs() < 0.05, "a = {}, expected ~0.5", m[0]);
    }

    #[test]
    fn test_align_face_output_size() {
        let raster = uniform(640, 480, 128);
        let aligned = align_face(&raster, &REFERENCE_LANDMARKS_112);
        assert_eq!(aligned.len(), ALIGNED_SIZE * ALIGNED_SIZE * CHANNELS);
    }

    #[test]
    fn test_landmark_roundtrip() {
        // A bright patch at the left eye lands near the reference left eye.
        let (w, h) = (200usize, 200usize);
        let mut data = vec![0u8; w * h * CHANNELS];

        let src_landmarks: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];

        let lx = src_landmarks[0].0 as usize;
        let ly = src_landmarks[0].1 as usize;
        for py in ly - 2..=ly + 2 {
            for px in lx - 2..=lx + 2 {
                let base = (py * w + px) * CHANNELS;
                data[base..base + CHANNELS].copy_from_slice(&[255, 255, 255]);
            }
        }
        let raster = Raster::from_rgb(w as u32, h as u32, data).unwrap();

        let aligned = align_face(&raster, &src_landmarks);

        let ref_x = REFERENCE_LANDMARKS_112[0].0.round() as usize;
        let ref_y = REFERENCE_LANDMARKS_112[0].1.round() as usize;
        let mut max_val = 0u8;
        for y in ref_y - 1..=ref_y + 1 {
            for x in ref_x - 1..=ref_x + 1 {
                max_val = max_val.max(aligned[(y * ALIGNED_SIZE + x) * CHANNELS]);
            }
        }
        assert!(max_val > 100, "expected bright patch near ({ref_x}, {ref_y}), max={max_val}");
    }

    #[test]
    fn test_crop_face_samples_region() {
        // Left half red, right half blue; a region over the right half crops to blue.
        let (w, h) = (100usize, 50usize);
        let mut data = vec![0u8; w * h * CHANNELS];
        for y in 0..h {
            for x in 0..w {
                let base = (y * w + x) * CHANNELS;
                let px = if x < 50 { [255, 0, 0] } else { [0, 0, 255] };
                data[base..base + CHANNELS].copy_from_slice(&px);
            }
        }
        let raster = Raster::from_rgb(w as u32, h as u32, data).unwrap();
        let region = FaceRegion {
            x: 60.0,
            y: 10.0,
            width: 30.0,
            height: 30.0,
            confidence: 1.0,
            landmarks: None,
        };

        let crop = crop_face(&raster, &region);
        assert_eq!(crop.len(), ALIGNED_SIZE * ALIGNED_SIZE * CHANNELS);
        let center = (56 * ALIGNED_SIZE + 56) * CHANNELS;
        assert_eq!(&crop[center..center + CHANNELS], &[0, 0, 255]);
    }

    #[test]
    fn test_normalize_face_is_deterministic() {
        let raster = uniform(64, 64, 77);
        let region = FaceRegion {
            x: 8.0,
            y: 8.0,
            width: 40.0,
            height: 40.0,
            confidence: 1.0,
            landmarks: None,
        };
        assert_eq!(normalize_face(&raster, &region), normalize_face(&raster, &region));
    }
}
