//! Durable storage of enrolled signatures, one file per identity.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use rollcall_core::Signature;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::errors::{StoreError, StoreResult};
use crate::identity::IdentityKey;

const RECORD_PREFIX: &str = "encoding_";
const RECORD_SUFFIX: &str = ".json";

/// Lazy walk over every enrolled signature in ascending key order.
pub type SignatureScan<'a> =
    Box<dyn Iterator<Item = Result<(String, Signature), StoreError>> + Send + 'a>;

/// Maps identity keys to signatures.
///
/// `put` replaces any previous signature for the key atomically: a concurrent
/// reader sees either the old or the new value, never a partial one.
pub trait SignatureStore: Send + Sync {
    fn put(&self, identity: &IdentityKey, signature: &Signature) -> StoreResult<()>;
    fn get(&self, identity: &IdentityKey) -> StoreResult<Option<Signature>>;
    /// Returns whether a signature existed.
    fn delete(&self, identity: &IdentityKey) -> StoreResult<bool>;
    fn scan(&self) -> StoreResult<SignatureScan<'_>>;
    fn keys(&self) -> StoreResult<Vec<IdentityKey>>;
    /// Where the signature for `identity` lives (or would live).
    fn location(&self, identity: &IdentityKey) -> PathBuf;
    fn root(&self) -> &Path;

    fn len(&self) -> StoreResult<usize> {
        Ok(self.keys()?.len())
    }

    fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SignatureRecord {
    identity: String,
    dimension: usize,
    /// Little-endian f32 values, base64 encoded.
    values: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model_version: Option<String>,
    /// Hex SHA-256 of the raw value bytes.
    checksum: String,
    updated_at: DateTime<Utc>,
}

/// [`SignatureStore`] keeping `encoding_<key>.json` files in one directory.
pub struct FileSignatureStore {
    dir: PathBuf,
}

impl FileSignatureStore {
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::io(&dir, source))?;
        Ok(Self { dir })
    }

    fn sorted_keys(&self) -> StoreResult<Vec<IdentityKey>> {
        let entries = fs::read_dir(&self.dir).map_err(|source| StoreError::io(&self.dir, source))?;
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::io(&self.dir, source))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(raw) = name
                .strip_prefix(RECORD_PREFIX)
                .and_then(|rest| rest.strip_suffix(RECORD_SUFFIX))
            else {
                continue;
            };
            match IdentityKey::parse(raw) {
                Ok(key) => keys.push(key),
                Err(err) => {
                    tracing::warn!(file = %name, error = %err, "ignoring signature file with invalid key")
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Reads one record. `Ok(None)` when the file does not exist.
    fn read_record(&self, identity: &IdentityKey) -> StoreResult<Option<Signature>> {
        let path = self.location(identity);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::io(path, source)),
        };

        let record: SignatureRecord =
            serde_json::from_slice(&data).map_err(|err| StoreError::Corrupt {
                path: path.clone(),
                message: format!("invalid record: {err}"),
            })?;
        decode_record(&path, identity, record).map(Some)
    }

    /// Dimension of the first readable record other than `except`. Corrupt
    /// records are skipped.
    fn stored_dimension(&self, except: &IdentityKey) -> StoreResult<Option<usize>> {
        for key in self.sorted_keys()? {
            if &key == except {
                continue;
            }
            match self.read_record(&key) {
                Ok(Some(existing)) => return Ok(Some(existing.len())),
                Ok(None) => {}
                Err(StoreError::Corrupt { path, message }) => {
                    tracing::warn!(
                        path = %path.display(),
                        %message,
                        "skipping corrupt signature while checking dimension"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }
}

impl SignatureStore for FileSignatureStore {
    fn put(&self, identity: &IdentityKey, signature: &Signature) -> StoreResult<()> {
        if let Some(expected) = self.stored_dimension(identity)? {
            if expected != signature.len() {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    found: signature.len(),
                });
            }
        }

        let bytes = values_to_bytes(&signature.values);
        let record = SignatureRecord {
            identity: identity.as_str().to_string(),
            dimension: signature.len(),
            values: general_purpose::STANDARD.encode(&bytes),
            model_version: signature.model_version.clone(),
            checksum: checksum_hex(&bytes),
            updated_at: Utc::now(),
        };
        let serialized = serde_json::to_vec_pretty(&record)?;
        write_atomically(&self.location(identity), &serialized)?;

        tracing::debug!(identity = %identity, dimension = signature.len(), "signature stored");
        Ok(())
    }

    fn get(&self, identity: &IdentityKey) -> StoreResult<Option<Signature>> {
        self.read_record(identity)
    }

    fn delete(&self, identity: &IdentityKey) -> StoreResult<bool> {
        let path = self.location(identity);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::io(path, source)),
        }
    }

    fn scan(&self) -> StoreResult<SignatureScan<'_>> {
        let keys = self.sorted_keys()?;
        // A key removed between listing and reading is skipped.
        let iter = keys.into_iter().filter_map(move |key| {
            self.read_record(&key)
                .transpose()
                .map(|result| result.map(|signature| (key.into_string(), signature)))
        });
        Ok(Box::new(iter))
    }

    fn keys(&self) -> StoreResult<Vec<IdentityKey>> {
        self.sorted_keys()
    }

    fn location(&self, identity: &IdentityKey) -> PathBuf {
        self.dir
            .join(format!("{RECORD_PREFIX}{}{RECORD_SUFFIX}", identity.as_str()))
    }

    fn root(&self) -> &Path {
        &self.dir
    }
}

fn decode_record(
    path: &Path,
    identity: &IdentityKey,
    record: SignatureRecord,
) -> StoreResult<Signature> {
    let corrupt = |message: String| StoreError::Corrupt {
        path: path.to_path_buf(),
        message,
    };

    if record.identity != identity.as_str() {
        return Err(corrupt(format!(
            "record belongs to '{}', not '{identity}'",
            record.identity
        )));
    }

    let bytes = general_purpose::STANDARD
        .decode(record.values.as_bytes())
        .map_err(|err| corrupt(format!("invalid base64 values: {err}")))?;
    if checksum_hex(&bytes) != record.checksum {
        return Err(corrupt("checksum mismatch".into()));
    }
    if bytes.len() % 4 != 0 || bytes.len() / 4 != record.dimension {
        return Err(corrupt(format!(
            "expected {} values, found {} bytes",
            record.dimension,
            bytes.len()
        )));
    }

    let values = bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    Ok(Signature {
        values,
        model_version: record.model_version,
    })
}

fn values_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

fn checksum_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Write `contents` to a temp file beside `path`, fsync, rename over it, then
/// fsync the directory. Once the rename has happened the call succeeds.
pub(crate) fn write_atomically(path: &Path, contents: &[u8]) -> StoreResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(parent).map_err(|source| StoreError::io(path, source))?;

    {
        let file = tmp.as_file_mut();
        {
            let mut writer = BufWriter::new(&mut *file);
            writer
                .write_all(contents)
                .and_then(|()| writer.flush())
                .map_err(|source| StoreError::io(path, source))?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))
                .map_err(|source| StoreError::io(path, source))?;
        }

        file.sync_all().map_err(|source| StoreError::io(path, source))?;
    }

    tmp.persist(path)
        .map_err(|err| StoreError::io(path, err.error))?;
    sync_dir_or_warn(parent);
    Ok(())
}

/// Flush a directory entry change (create, rename, unlink) to disk.
pub(crate) fn sync_dir_or_warn(dir: &Path) {
    if let Err(err) = sync_dir(dir) {
        tracing::warn!(dir = %dir.display(), error = %err, "directory fsync failed");
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
