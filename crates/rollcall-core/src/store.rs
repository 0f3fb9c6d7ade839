//! Durable identity → encoding store.
//!
//! One JSON file per identity under the store directory, named after the
//! identity id. The whole store is loaded into memory at open; every write
//! lands on disk first and is mirrored in memory only once it succeeded.

use crate::matcher::{EuclideanMatcher, MatchResult, Matcher};
use crate::types::{validate_identity_id, Encoding, EnrolledIdentity, InvalidIdentity, ENCODING_DIM};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

const RECORD_EXTENSION: &str = "json";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid encoding: expected {expected} dimensions, got {actual}")]
    InvalidEncoding { expected: usize, actual: usize },
    #[error("invalid encoding: component {index} is not finite")]
    NonFiniteEncoding { index: usize },
    #[error(transparent)]
    InvalidIdentity(#[from] InvalidIdentity),
    #[error("record {path} holds identity {found}")]
    MisnamedRecord { path: PathBuf, found: String },
    #[error("identity not enrolled: {0}")]
    UnknownIdentity(String),
    #[error("store I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("encoding record serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// In-memory mirror of the on-disk encoding records.
pub struct EncodingStore {
    dir: PathBuf,
    entries: BTreeMap<String, EnrolledIdentity>,
}

impl EncodingStore {
    /// Open (creating if needed) the store directory and load every record.
    ///
    /// Unreadable records and records of the wrong dimensionality are skipped
    /// with a warning rather than failing startup.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io { path: dir.clone(), source })?;

        let mut entries = BTreeMap::new();
        let listing =
            fs::read_dir(&dir).map_err(|source| StoreError::Io { path: dir.clone(), source })?;

        for dirent in listing {
            let path = match dirent {
                Ok(d) => d.path(),
                Err(e) => {
                    tracing::warn!(
                        dir = %dir.display(),
                        error = %e,
                        "skipping unreadable directory entry"
                    );
                    continue;
                }
            };
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }

            match read_record(&path) {
                Ok(record) => {
                    tracing::debug!(identity = %record.identity_id, "loaded encoding");
                    entries.insert(record.identity_id.clone(), record);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping encoding record");
                }
            }
        }

        tracing::info!(dir = %dir.display(), identities = entries.len(), "encoding store opened");
        Ok(Self { dir, entries })
    }

    /// Store or overwrite the encoding for `identity_id`.
    ///
    /// Fails without touching disk or memory if the encoding is not
    /// [`ENCODING_DIM`]-dimensional or holds a non-finite component.
    pub fn enroll(
        &mut self,
        identity_id: &str,
        encoding: Encoding,
    ) -> Result<&EnrolledIdentity, StoreError> {
        validate_identity_id(identity_id)?;
        check_encoding(&encoding)?;

        let record = EnrolledIdentity {
            identity_id: identity_id.to_string(),
            encoding,
            source_crop_path: None,
            enrolled_at: chrono::Utc::now().to_rfc3339(),
        };
        self.write_record(&record)?;

        let replaced = self.entries.insert(identity_id.to_string(), record).is_some();
        tracing::info!(identity = identity_id, replaced, "encoding stored");
        Ok(&self.entries[identity_id])
    }

    /// Record where the training crop for an enrolled identity was written.
    pub fn attach_crop(&mut self, identity_id: &str, crop: PathBuf) -> Result<(), StoreError> {
        let mut record = self
            .entries
            .get(identity_id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownIdentity(identity_id.to_string()))?;
        record.source_crop_path = Some(crop);
        self.write_record(&record)?;
        self.entries.insert(identity_id.to_string(), record);
        Ok(())
    }

    /// Delete an identity. Returns whether it was enrolled.
    pub fn remove(&mut self, identity_id: &str) -> Result<bool, StoreError> {
        validate_identity_id(identity_id)?;
        if !self.entries.contains_key(identity_id) {
            return Ok(false);
        }
        let path = self.record_path(identity_id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(StoreError::Io { path, source }),
        }
        self.entries.remove(identity_id);
        tracing::info!(identity = identity_id, "identity removed");
        Ok(true)
    }

    /// Match a probe against every stored encoding.
    pub fn match_encoding(&self, probe: &Encoding, tolerance: f32) -> MatchResult {
        EuclideanMatcher.compare(probe, self.entries.values(), tolerance)
    }

    pub fn get(&self, identity_id: &str) -> Option<&EnrolledIdentity> {
        self.entries.get(identity_id)
    }

    /// Enrolled identity ids in lexicographic order.
    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, identity_id: &str) -> PathBuf {
        self.dir.join(format!("{identity_id}.{RECORD_EXTENSION}"))
    }

    /// Write via a temporary sibling and rename, so a crash never leaves a
    /// truncated record behind.
    fn write_record(&self, record: &EnrolledIdentity) -> Result<(), StoreError> {
        let path = self.record_path(&record.identity_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(record)?;

        fs::write(&tmp, bytes).map_err(|source| StoreError::Io { path: tmp.clone(), source })?;
        fs::rename(&tmp, &path).map_err(|source| {
            let _ = fs::remove_file(&tmp);
            StoreError::Io { path: path.clone(), source }
        })
    }
}

fn check_encoding(encoding: &Encoding) -> Result<(), StoreError> {
    if encoding.dim() != ENCODING_DIM {
        return Err(StoreError::InvalidEncoding {
            expected: ENCODING_DIM,
            actual: encoding.dim(),
        });
    }
    match encoding.values.iter().position(|v| !v.is_finite()) {
        Some(index) => Err(StoreError::NonFiniteEncoding { index }),
        None => Ok(()),
    }
}

/// Parse one record. The identity inside must match the file stem, so a
/// record can neither shadow another identity nor escape `remove`.
fn read_record(path: &Path) -> Result<EnrolledIdentity, StoreError> {
    let bytes = fs::read(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let record: EnrolledIdentity = serde_json::from_slice(&bytes)?;
    check_encoding(&record.encoding)?;
    validate_identity_id(&record.identity_id)?;
    if path.file_stem().and_then(|s| s.to_str()) != Some(record.identity_id.as_str()) {
        return Err(StoreError::MisnamedRecord {
            path: path.to_path_buf(),
            found: record.identity_id,
        });
    }
    Ok(record)
}
