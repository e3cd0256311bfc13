use std::fs;
use std::path::{Path, PathBuf};

use rollcall_core::{DEFAULT_CONFIDENCE_THRESHOLD, DETECTOR_MODEL_FILE, EXTRACTOR_MODEL_FILE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Engine configuration.
///
/// Resolution order: built-in defaults, then an optional TOML file, then
/// `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Root for signatures, photos and the database.
    pub data_dir: PathBuf,
    /// Directory holding the ONNX models. Defaults to `<data_dir>/models`.
    pub model_dir: Option<PathBuf>,
    /// Minimum `1 - distance` for a match.
    pub confidence_threshold: f32,
    /// Smallest face the detector reports, in letterboxed input pixels.
    pub min_face_size: f32,
    /// Longer side of stored enrollment photos.
    pub photo_max_dimension: u32,
    /// JPEG quality of stored enrollment photos (1-100).
    pub photo_quality: u8,
    /// ONNX Runtime intra-op threads per session.
    pub inference_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(&|key: &str| std::env::var(key).ok()),
            model_dir: None,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            min_face_size: 80.0,
            photo_max_dimension: 400,
            photo_quality: 85,
            inference_threads: 2,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Read a TOML file, then apply environment overrides.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `ROLLCALL_*` overrides read through `lookup`. Unparseable values
    /// are ignored with a warning.
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup("ROLLCALL_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("ROLLCALL_MODEL_DIR") {
            self.model_dir = Some(PathBuf::from(dir));
        }
        self.confidence_threshold = env_f32(
            &lookup,
            "ROLLCALL_CONFIDENCE_THRESHOLD",
            self.confidence_threshold,
        );
        self.min_face_size = env_f32(&lookup, "ROLLCALL_MIN_FACE_SIZE", self.min_face_size);
        self.photo_max_dimension = env_u32(
            &lookup,
            "ROLLCALL_PHOTO_MAX_DIMENSION",
            self.photo_max_dimension,
        );
        self.photo_quality = env_u8(&lookup, "ROLLCALL_PHOTO_QUALITY", self.photo_quality);
        self.inference_threads =
            env_usize(&lookup, "ROLLCALL_INFERENCE_THREADS", self.inference_threads);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid(format!(
                "confidence_threshold must be within [0, 1], got {threshold}"
            )));
        }
        if !(self.min_face_size.is_finite() && self.min_face_size > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "min_face_size must be positive, got {}",
                self.min_face_size
            )));
        }
        if self.photo_max_dimension == 0 {
            return Err(ConfigError::Invalid("photo_max_dimension must be positive".into()));
        }
        if !(1..=100).contains(&self.photo_quality) {
            return Err(ConfigError::Invalid(format!(
                "photo_quality must be within 1..=100, got {}",
                self.photo_quality
            )));
        }
        if self.inference_threads == 0 {
            return Err(ConfigError::Invalid("inference_threads must be positive".into()));
        }
        Ok(())
    }

    pub fn model_dir(&self) -> PathBuf {
        self.model_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("models"))
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir().join(DETECTOR_MODEL_FILE)
    }

    /// Path to the ArcFace recognition model.
    pub fn extractor_model_path(&self) -> PathBuf {
        self.model_dir().join(EXTRACTOR_MODEL_FILE)
    }

    pub fn signature_dir(&self) -> PathBuf {
        self.data_dir.join("signatures")
    }

    pub fn photo_dir(&self) -> PathBuf {
        self.data_dir.join("photos")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("rollcall.db")
    }
}

fn default_data_dir(lookup: &dyn Fn(&str) -> Option<String>) -> PathBuf {
    lookup("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn env_parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    current: T,
) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            current
        }),
        None => current,
    }
}

fn env_f32(lookup: &impl Fn(&str) -> Option<String>, key: &str, current: f32) -> f32 {
    env_parse(lookup, key, current)
}

fn env_u32(lookup: &impl Fn(&str) -> Option<String>, key: &str, current: u32) -> u32 {
    env_parse(lookup, key, current)
}

fn env_u8(lookup: &impl Fn(&str) -> Option<String>, key: &str, current: u8) -> u8 {
    env_parse(lookup, key, current)
}

fn env_usize(lookup: &impl Fn(&str) -> Option<String>, key: &str, current: usize) -> usize {
    env_parse(lookup, key, current)
}
