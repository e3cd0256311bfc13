#![allow(dead_code)]

use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use rollcall_core::{
    DetectorError, ExtractorError, FaceDetector, FaceRegion, ImageInput, Raster, Signature,
    SignatureExtractor,
};
use rollcall_engine::{
    Engine, EngineConfig, FacePipeline, FileSignatureStore, IdentityKey, SignatureScan,
    SignatureStore, StoreError, StoreResult,
};
use tempfile::TempDir;

pub const ADA: [u8; 3] = [200, 120, 90];
pub const GRACE: [u8; 3] = [90, 200, 120];

const CANVAS: u32 = 240;
const MIN_BLOB_PIXELS: usize = 16;

/// Treats every connected patch of non-black pixels as a face.
pub struct BlobDetector;

impl FaceDetector for BlobDetector {
    fn detect(&mut self, raster: &Raster) -> Result<Vec<FaceRegion>, DetectorError> {
        let (width, height) = (raster.width() as usize, raster.height() as usize);
        let lit = |x: usize, y: usize| raster.pixel(x, y).iter().any(|&c| c > 16);
        let mut seen = vec![false; width * height];
        let mut regions = Vec::new();

        for y in 0..height {
            for x in 0..width {
                if seen[y * width + x] || !lit(x, y) {
                    continue;
                }
                let (mut x0, mut y0, mut x1, mut y1) = (x, y, x, y);
                let mut pixels = 0usize;
                let mut stack = vec![(x, y)];
                seen[y * width + x] = true;
                while let Some((px, py)) = stack.pop() {
                    pixels += 1;
                    x0 = x0.min(px);
                    y0 = y0.min(py);
                    x1 = x1.max(px);
                    y1 = y1.max(py);
                    let neighbours = [
                        (px.wrapping_sub(1), py),
                        (px + 1, py),
                        (px, py.wrapping_sub(1)),
                        (px, py + 1),
                    ];
                    for (nx, ny) in neighbours {
                        if nx < width && ny < height && !seen[ny * width + nx] && lit(nx, ny) {
                            seen[ny * width + nx] = true;
                            stack.push((nx, ny));
                        }
                    }
                }
                if pixels >= MIN_BLOB_PIXELS {
                    regions.push(FaceRegion {
                        x: x0 as f32,
                        y: y0 as f32,
                        width: (x1 - x0 + 1) as f32,
                        height: (y1 - y0 + 1) as f32,
                        confidence: 1.0,
                        landmarks: None,
                    });
                }
            }
        }
        Ok(regions)
    }
}

/// Signature = mean colour of the region, scaled to [0, 1].
pub struct MeanColorExtractor;

impl SignatureExtractor for MeanColorExtractor {
    fn extract(&mut self, raster: &Raster, region: &FaceRegion) -> Result<Signature, ExtractorError> {
        let (x0, y0) = (region.x as usize, region.y as usize);
        let (x1, y1) = (
            x0 + region.width as usize,
            y0 + region.height as usize,
        );
        if x1 <= x0 || y1 <= y0 {
            return Err(ExtractorError::EmptyRegion);
        }

        let mut sum = [0f64; 3];
        for y in y0..y1 {
            for x in x0..x1 {
                for (acc, value) in sum.iter_mut().zip(raster.pixel(x, y)) {
                    *acc += f64::from(value);
                }
            }
        }
        let count = ((x1 - x0) * (y1 - y0)) as f64;
        Ok(Signature {
            values: sum.iter().map(|s| (s / count / 255.0) as f32).collect(),
            model_version: Some("mean-rgb".into()),
        })
    }
}

/// A square "face" of `color` with its top-left corner at (`x`, `y`).
pub struct Face {
    pub x: u32,
    pub y: u32,
    pub side: u32,
    pub color: [u8; 3],
}

pub fn face(x: u32, y: u32, side: u32, color: [u8; 3]) -> Face {
    Face { x, y, side, color }
}

/// PNG bytes: black canvas with the given faces painted on it.
pub fn portrait(faces: &[Face]) -> Vec<u8> {
    let mut img = image::RgbImage::new(CANVAS, CANVAS);
    for f in faces {
        for y in f.y..(f.y + f.side).min(CANVAS) {
            for x in f.x..(f.x + f.side).min(CANVAS) {
                img.put_pixel(x, y, image::Rgb(f.color));
            }
        }
    }
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

/// One centred face.
pub fn single(color: [u8; 3]) -> ImageInput {
    ImageInput::bytes(portrait(&[face(70, 70, 100, color)]))
}

pub fn empty_room() -> ImageInput {
    ImageInput::bytes(portrait(&[]))
}

pub fn two_people() -> ImageInput {
    ImageInput::bytes(portrait(&[face(10, 10, 80, ADA), face(140, 140, 80, GRACE)]))
}

pub fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 9, d).unwrap()
}

pub fn key(raw: &str) -> IdentityKey {
    IdentityKey::parse(raw).unwrap()
}

pub fn config(data_dir: &Path) -> EngineConfig {
    EngineConfig {
        data_dir: data_dir.to_path_buf(),
        ..EngineConfig::default()
    }
}

pub fn pipeline() -> FacePipeline {
    FacePipeline::new(Box::new(BlobDetector), Box::new(MeanColorExtractor))
}

pub fn engine(tmp: &TempDir) -> Engine {
    Engine::with_components(
        config(tmp.path()),
        Box::new(BlobDetector),
        Box::new(MeanColorExtractor),
    )
    .unwrap()
}

/// Engine whose signature store can be told to fail writes.
pub fn engine_with_flaky_store(tmp: &TempDir) -> (Engine, Arc<FlakySignatureStore>) {
    let config = config(tmp.path());
    let store = Arc::new(FlakySignatureStore::new(config.signature_dir()));
    let engine =
        Engine::with_signature_store(config, pipeline(), store.clone()).unwrap();
    (engine, store)
}

/// File names in `dir`, sorted. Empty when the directory does not exist.
pub fn files_in(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

pub fn signature_files(tmp: &TempDir) -> Vec<String> {
    files_in(&tmp.path().join("signatures"))
}

pub fn photo_files(tmp: &TempDir) -> Vec<String> {
    files_in(&tmp.path().join("photos"))
}

/// Separate connection to the engine's database under `tmp`.
pub fn database(tmp: &TempDir) -> rusqlite::Connection {
    rusqlite::Connection::open(tmp.path().join("rollcall.db")).unwrap()
}

/// Make every insert or update of the `identities` table fail.
pub fn freeze_directory(tmp: &TempDir) {
    database(tmp)
        .execute_batch(
            "CREATE TRIGGER deny_insert BEFORE INSERT ON identities
             BEGIN SELECT RAISE(ABORT, 'directory is read-only'); END;
             CREATE TRIGGER deny_update BEFORE UPDATE ON identities
             BEGIN SELECT RAISE(ABORT, 'directory is read-only'); END;",
        )
        .unwrap();
}

/// `(identity_key, display_name)` rows, sorted by key.
pub fn directory_rows(tmp: &TempDir) -> Vec<(String, String)> {
    let conn = database(tmp);
    let mut stmt = conn
        .prepare("SELECT identity_key, display_name FROM identities ORDER BY identity_key")
        .unwrap();
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    rows
}

/// Put a directory where the photo for `identity` goes, so committing a
/// staged photo over it fails.
pub fn block_photo(tmp: &TempDir, identity: &str) {
    let path = tmp.path().join("photos").join(format!("photo_{identity}.jpg"));
    if path.is_file() {
        fs::remove_file(&path).unwrap();
    }
    fs::create_dir_all(path).unwrap();
}

/// [`FileSignatureStore`] with an injectable `put` failure.
pub struct FlakySignatureStore {
    inner: FileSignatureStore,
    fail_puts: AtomicBool,
}

impl FlakySignatureStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            inner: FileSignatureStore::open(dir).unwrap(),
            fail_puts: AtomicBool::new(false),
        }
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }
}

impl SignatureStore for FlakySignatureStore {
    fn put(&self, identity: &IdentityKey, signature: &Signature) -> StoreResult<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StoreError::Io {
                path: self.inner.location(identity),
                source: io::Error::other("disk full"),
            });
        }
        self.inner.put(identity, signature)
    }

    fn get(&self, identity: &IdentityKey) -> StoreResult<Option<Signature>> {
        self.inner.get(identity)
    }

    fn delete(&self, identity: &IdentityKey) -> StoreResult<bool> {
        self.inner.delete(identity)
    }

    fn scan(&self) -> StoreResult<SignatureScan<'_>> {
        self.inner.scan()
    }

    fn keys(&self) -> StoreResult<Vec<IdentityKey>> {
        self.inner.keys()
    }

    fn location(&self, identity: &IdentityKey) -> PathBuf {
        self.inner.location(identity)
    }

    fn root(&self) -> &Path {
        self.inner.root()
    }
}
