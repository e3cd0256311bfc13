//! Enrollment photos: downsized JPEG copies kept next to the signatures.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::ImageEncoder;
use rollcall_core::{FaceRegion, Raster};
use tempfile::NamedTempFile;

use crate::errors::{StoreError, StoreResult};
use crate::identity::IdentityKey;
use crate::store::sync_dir_or_warn;

/// Where and how enrollment photos are written.
#[derive(Debug, Clone)]
pub struct PhotoStore {
    dir: PathBuf,
    max_dimension: u32,
    quality: u8,
    min_face_size: f32,
}

/// An encoded photo written to a temp file in the photo directory. Dropping it
/// without [`PhotoStore::commit`] removes the file.
pub struct StagedPhoto {
    file: NamedTempFile,
    width: u32,
    height: u32,
}

impl StagedPhoto {
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

impl PhotoStore {
    pub fn open(
        dir: impl Into<PathBuf>,
        max_dimension: u32,
        quality: u8,
        min_face_size: f32,
    ) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::io(&dir, source))?;
        Ok(Self {
            dir,
            max_dimension,
            quality,
            min_face_size,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, identity: &IdentityKey) -> PathBuf {
        self.dir.join(format!("photo_{}.jpg", identity.as_str()))
    }

    pub fn exists(&self, identity: &IdentityKey) -> bool {
        self.path_for(identity).is_file()
    }

    /// Downsize and JPEG-encode `raster` into a staging file.
    pub fn stage(&self, raster: &Raster, face: &FaceRegion) -> StoreResult<StagedPhoto> {
        let (width, height) = target_size(
            raster.width(),
            raster.height(),
            face,
            self.max_dimension,
            self.min_face_size,
        );

        let mut photo = raster.to_rgb_image();
        if (width, height) != (raster.width(), raster.height()) {
            photo = image::imageops::resize(&photo, width, height, FilterType::Lanczos3);
        }

        let mut file =
            NamedTempFile::new_in(&self.dir).map_err(|source| StoreError::io(&self.dir, source))?;
        let staged_path = file.path().to_path_buf();
        {
            let mut writer = BufWriter::new(file.as_file_mut());
            JpegEncoder::new_with_quality(&mut writer, self.quality)
                .write_image(photo.as_raw(), width, height, image::ExtendedColorType::Rgb8)
                .map_err(|source| StoreError::PhotoEncode {
                    path: staged_path.clone(),
                    source,
                })?;
            writer
                .flush()
                .map_err(|source| StoreError::io(&staged_path, source))?;
        }
        file.as_file()
            .sync_all()
            .map_err(|source| StoreError::io(&staged_path, source))?;

        tracing::debug!(
            source_width = raster.width(),
            source_height = raster.height(),
            width,
            height,
            "photo staged"
        );
        Ok(StagedPhoto {
            file,
            width,
            height,
        })
    }

    /// Atomically move a staged photo to `photo_<key>.jpg`, replacing any
    /// previous photo.
    pub fn commit(&self, staged: StagedPhoto, identity: &IdentityKey) -> StoreResult<PathBuf> {
        let path = self.path_for(identity);
        staged
            .file
            .persist(&path)
            .map_err(|err| StoreError::io(&path, err.error))?;
        sync_dir_or_warn(&self.dir);
        Ok(path)
    }

    /// Returns whether a photo existed.
    pub fn delete(&self, identity: &IdentityKey) -> StoreResult<bool> {
        let path = self.path_for(identity);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::io(path, source)),
        }
    }
}

/// Output size: fit the longer side within `max_dimension`, unless that would
/// shrink the face's shorter side below `min_face_size`. Never upscales.
fn target_size(
    width: u32,
    height: u32,
    face: &FaceRegion,
    max_dimension: u32,
    min_face_size: f32,
) -> (u32, u32) {
    let longest = width.max(height) as f32;
    let fit = max_dimension as f32 / longest;

    let face_side = face.width.min(face.height);
    let keep_face = if face_side > 0.0 {
        min_face_size / face_side
    } else {
        0.0
    };

    let scale = fit.max(keep_face).min(1.0);
    if scale >= 1.0 {
        return (width, height);
    }
    let scaled = |side: u32| ((side as f32 * scale).round() as u32).max(1);
    (scaled(width), scaled(height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn face(side: f32) -> FaceRegion {
        FaceRegion {
            x: 0.0,
            y: 0.0,
            width: side,
            height: side,
            confidence: 1.0,
            landmarks: None,
        }
    }

    fn raster(width: u32, height: u32) -> Raster {
        Raster::from_rgb(width, height, vec![128; (width * height * 3) as usize]).unwrap()
    }

    #[test]
    fn test_small_images_keep_their_size() {
        assert_eq!(target_size(300, 200, &face(100.0), 400, 80.0), (300, 200));
    }

    #[test]
    fn test_large_images_fit_the_longer_side() {
        assert_eq!(target_size(1600, 800, &face(800.0), 400, 80.0), (400, 200));
        assert_eq!(target_size(600, 1200, &face(600.0), 400, 80.0), (200, 400));
    }

    #[test]
    fn test_small_faces_limit_the_shrink() {
        // Fitting would give scale 0.25 and a 40 px face; 80 px needs 0.5.
        assert_eq!(target_size(1600, 1600, &face(160.0), 400, 80.0), (800, 800));
    }

    #[test]
    fn test_stage_and_commit_replace_photo() {
        let dir = tempdir().unwrap();
        let photos = PhotoStore::open(dir.path(), 400, 85, 80.0).unwrap();
        let key = IdentityKey::parse("S1").unwrap();

        let staged = photos.stage(&raster(800, 600), &face(400.0)).unwrap();
        assert_eq!(staged.dimensions(), (400, 300));
        let path = photos.commit(staged, &key).unwrap();
        assert!(path.ends_with("photo_S1.jpg"));

        let stored = image::open(&path).unwrap();
        assert_eq!((stored.width(), stored.height()), (400, 300));

        let staged = photos.stage(&raster(100, 50), &face(40.0)).unwrap();
        photos.commit(staged, &key).unwrap();
        let stored = image::open(&path).unwrap();
        assert_eq!((stored.width(), stored.height()), (100, 50));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_dropped_stage_leaves_nothing() {
        let dir = tempdir().unwrap();
        let photos = PhotoStore::open(dir.path(), 400, 85, 80.0).unwrap();

        let staged = photos.stage(&raster(64, 64), &face(32.0)).unwrap();
        assert!(staged.path().exists());
        drop(staged);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let photos = PhotoStore::open(dir.path(), 400, 85, 80.0).unwrap();
        let key = IdentityKey::parse("S1").unwrap();

        let staged = photos.stage(&raster(32, 32), &face(16.0)).unwrap();
        photos.commit(staged, &key).unwrap();
        assert!(photos.exists(&key));
        assert!(photos.delete(&key).unwrap());
        assert!(!photos.delete(&key).unwrap());
        assert!(!photos.exists(&key));
    }
}
