//! Per-identity face-crop corpus used to train the classifier.
//!
//! Layout: `<root>/<identity_id>/<identity_id>_<timestamp>_<seq>.png`.
//! Class enumeration is the sorted list of identity directories holding at
//! least one image, which fixes the class-index order for a training run.

use crate::imaging;
use crate::types::{validate_identity_id, InvalidIdentity};
use image::{ImageFormat, RgbImage};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CorpusError {
    #[error(transparent)]
    InvalidIdentity(#[from] InvalidIdentity),
    #[error("corpus I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write crop {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// One training image and the class directory it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub path: PathBuf,
    pub identity_id: String,
}

/// Snapshot of the corpus contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorpusIndex {
    /// Identities with at least one image, sorted.
    pub identities: Vec<String>,
    pub samples: Vec<Sample>,
}

pub struct TrainingCorpus {
    root: PathBuf,
    seq: AtomicU64,
}

impl TrainingCorpus {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CorpusError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| CorpusError::Io { path: root.clone(), source })?;
        Ok(Self { root, seq: AtomicU64::new(0) })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist a face crop under `identity_id`, returning its path.
    pub fn add_crop(&self, identity_id: &str, crop: &RgbImage) -> Result<PathBuf, CorpusError> {
        validate_identity_id(identity_id)?;
        let dir = self.root.join(identity_id);
        fs::create_dir_all(&dir).map_err(|source| CorpusError::Io { path: dir.clone(), source })?;

        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%3f");
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("{identity_id}_{stamp}_{seq}.png"));
        // Scans skip the tmp name, so a reader never sees a partial PNG.
        let tmp = path.with_extension("png.tmp");

        crop.save_with_format(&tmp, ImageFormat::Png).map_err(|source| {
            let _ = fs::remove_file(&tmp);
            CorpusError::Encode { path: tmp.clone(), source }
        })?;
        fs::rename(&tmp, &path).map_err(|source| {
            let _ = fs::remove_file(&tmp);
            CorpusError::Io { path: path.clone(), source }
        })?;
        tracing::debug!(identity = identity_id, path = %path.display(), "corpus crop written");
        Ok(path)
    }

    /// Delete every crop of `identity_id`. Returns whether it had a directory.
    pub fn remove_identity(&self, identity_id: &str) -> Result<bool, CorpusError> {
        validate_identity_id(identity_id)?;
        let dir = self.root.join(identity_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::info!(identity = identity_id, "corpus crops removed");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(CorpusError::Io { path: dir, source }),
        }
    }

    /// Enumerate identities and their images.
    pub fn scan(&self) -> Result<CorpusIndex, CorpusError> {
        scan_dir(&self.root)
    }
}

/// Enumerate a class-per-directory image tree. Non-directories at the top
/// level, files without an allowed image extension, and directories whose
/// names are not valid identity ids are ignored.
pub fn scan_dir(root: &Path) -> Result<CorpusIndex, CorpusError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: io::Error| CorpusError::Io { path, source }
    };

    let mut class_dirs: Vec<(String, PathBuf)> = Vec::new();
    for entry in fs::read_dir(root).map_err(io_err(root))? {
        let entry = entry.map_err(io_err(root))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        if validate_identity_id(&name).is_err() {
            tracing::warn!(
                dir = %path.display(),
                "ignoring corpus directory with invalid identity name"
            );
            continue;
        }
        class_dirs.push((name, path));
    }
    class_dirs.sort();

    let mut index = CorpusIndex::default();
    for (identity_id, dir) in class_dirs {
        let mut images: Vec<PathBuf> = fs::read_dir(&dir)
            .map_err(io_err(&dir))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && imaging::has_allowed_extension(p))
            .collect();
        if images.is_empty() {
            continue;
        }
        images.sort();

        index.samples.extend(images.into_iter().map(|path| Sample {
            path,
            identity_id: identity_id.clone(),
        }));
        index.identities.push(identity_id);
    }

    Ok(index)
}
