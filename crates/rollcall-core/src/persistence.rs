//! Classifier artifacts on disk.
//!
//! One model generation is two files sharing a path prefix:
//! `<prefix>.safetensors` holds every variable and `<prefix>.classes.json`
//! holds the class-index map plus enough metadata to rebuild the network.
//! The JSON records the SHA-256 of the weights it was written with, so a pair
//! torn by a crash between the two renames is rejected at load.

use crate::classifier::{Architecture, ClassIndexMap, ClassifierError, ClassifierModel, ModelState};
use candle_core::Device;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const FORMAT_VERSION: u32 = 1;

const WEIGHTS_SUFFIX: &str = ".safetensors";
const CLASSES_SUFFIX: &str = ".classes.json";
const HEAD_OUTPUT_BIAS: &str = "head.out.bias";

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("model artifact missing: {0}")]
    Missing(PathBuf),
    #[error("model artifact I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt model artifact {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("unsupported model format version {0}")]
    UnsupportedVersion(u32),
    #[error("weights {0} do not match the checksum recorded with the class map")]
    ChecksumMismatch(PathBuf),
    #[error("only trained models are persisted, found {0:?}")]
    Untrained(ModelState),
    #[error("class map has {classes} classes but the weights have {outputs} outputs")]
    ClassCountMismatch { classes: usize, outputs: usize },
    #[error(transparent)]
    Model(#[from] ClassifierError),
    #[error("serialize class map: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub weights: PathBuf,
    pub classes: PathBuf,
}

pub fn artifact_paths(prefix: &Path) -> ArtifactPaths {
    ArtifactPaths {
        weights: with_suffix(prefix, WEIGHTS_SUFFIX),
        classes: with_suffix(prefix, CLASSES_SUFFIX),
    }
}

/// Whether both artifacts of a generation exist.
pub fn exists(prefix: &Path) -> bool {
    let paths = artifact_paths(prefix);
    paths.weights.exists() && paths.classes.exists()
}

#[derive(Debug, Serialize, Deserialize)]
struct ClassMapRecord {
    format_version: u32,
    classes: ClassIndexMap,
    architecture: Architecture,
    state: ModelState,
    unfrozen_layers: usize,
    weights_sha256: String,
    saved_at: String,
}

/// Write a trained model. Weights land first, then the class map.
///
/// Both artifacts are staged as tmp files and renamed into place. Staging
/// files are removed on failure, and if the class map cannot be renamed the
/// previous weights are put back so the last good generation stays loadable.
pub fn save(model: &ClassifierModel, prefix: &Path) -> Result<ArtifactPaths, PersistenceError> {
    if !model.state().is_trained() {
        return Err(PersistenceError::Untrained(model.state()));
    }

    let paths = artifact_paths(prefix);
    if let Some(parent) = prefix.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    let tmp_weights = with_suffix(&paths.weights, ".tmp");
    let tmp_classes = with_suffix(&paths.classes, ".tmp");
    let record = match stage(model, &tmp_weights, &tmp_classes) {
        Ok(record) => record,
        Err(e) => {
            discard(&[&tmp_weights, &tmp_classes]);
            return Err(e);
        }
    };

    let prev_weights = with_suffix(&paths.weights, ".prev");
    let had_previous = match fs::rename(&paths.weights, &prev_weights) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(source) => {
            discard(&[&tmp_weights, &tmp_classes]);
            return Err(PersistenceError::Io { path: paths.weights.clone(), source });
        }
    };

    let installed = fs::rename(&tmp_weights, &paths.weights)
        .map_err(io_err(&paths.weights))
        .and_then(|()| fs::rename(&tmp_classes, &paths.classes).map_err(io_err(&paths.classes)));
    if let Err(e) = installed {
        discard(&[&tmp_weights, &tmp_classes]);
        if had_previous {
            if let Err(restore) = fs::rename(&prev_weights, &paths.weights) {
                tracing::warn!(error = %restore, "could not restore previous classifier weights");
            }
        }
        return Err(e);
    }
    if had_previous {
        discard(&[&prev_weights]);
    }

    tracing::info!(
        weights = %paths.weights.display(),
        classes = record.classes.len(),
        state = ?record.state,
        "classifier saved"
    );
    Ok(paths)
}

/// Write both artifacts to their staging paths.
fn stage(
    model: &ClassifierModel,
    tmp_weights: &Path,
    tmp_classes: &Path,
) -> Result<ClassMapRecord, PersistenceError> {
    model.save_weights(tmp_weights)?;
    let bytes = fs::read(tmp_weights).map_err(io_err(tmp_weights))?;

    let record = ClassMapRecord {
        format_version: FORMAT_VERSION,
        classes: model.class_map().clone(),
        architecture: model.architecture().clone(),
        state: model.state(),
        unfrozen_layers: model.unfrozen_layers(),
        weights_sha256: sha256_hex(&bytes),
        saved_at: chrono::Utc::now().to_rfc3339(),
    };
    fs::write(tmp_classes, serde_json::to_vec_pretty(&record)?).map_err(io_err(tmp_classes))?;
    Ok(record)
}

fn discard(paths: &[&Path]) {
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %path.display(),
                error = %e,
                "could not remove stale artifact"
            ),
        }
    }
}

/// Rebuild a model from its artifacts, validating the pair.
pub fn load(prefix: &Path, device: &Device) -> Result<ClassifierModel, PersistenceError> {
    let paths = artifact_paths(prefix);
    for path in [&paths.weights, &paths.classes] {
        if !path.exists() {
            return Err(PersistenceError::Missing(path.clone()));
        }
    }

    let raw = fs::read(&paths.classes).map_err(io_err(&paths.classes))?;
    let record: ClassMapRecord =
        serde_json::from_slice(&raw).map_err(|e| PersistenceError::Corrupt {
            path: paths.classes.clone(),
            reason: e.to_string(),
        })?;
    if record.format_version != FORMAT_VERSION {
        return Err(PersistenceError::UnsupportedVersion(record.format_version));
    }
    if !record.state.is_trained() {
        return Err(PersistenceError::Untrained(record.state));
    }

    let bytes = fs::read(&paths.weights).map_err(io_err(&paths.weights))?;
    if sha256_hex(&bytes) != record.weights_sha256 {
        return Err(PersistenceError::ChecksumMismatch(paths.weights.clone()));
    }
    let tensors = candle_core::safetensors::load_buffer(&bytes, device).map_err(|e| {
        PersistenceError::Corrupt {
            path: paths.weights.clone(),
            reason: e.to_string(),
        }
    })?;

    let outputs = tensors
        .get(HEAD_OUTPUT_BIAS)
        .and_then(|t| t.dims().first().copied())
        .ok_or_else(|| PersistenceError::Corrupt {
            path: paths.weights.clone(),
            reason: format!("missing {HEAD_OUTPUT_BIAS}"),
        })?;
    if outputs != record.classes.len() {
        return Err(PersistenceError::ClassCountMismatch {
            classes: record.classes.len(),
            outputs,
        });
    }

    let mut model = ClassifierModel::build(record.architecture, record.classes, device)?;
    model.set_weights(&tensors)?;
    model.restore(record.state, record.unfrozen_layers)?;

    tracing::info!(
        weights = %paths.weights.display(),
        classes = model.num_classes(),
        state = ?model.state(),
        saved_at = %record.saved_at,
        "classifier loaded"
    );
    Ok(model)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().fold(String::with_capacity(64), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = OsString::from(path.as_os_str());
    s.push(suffix);
    PathBuf::from(s)
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> PersistenceError {
    let path = path.to_path_buf();
    move |source| PersistenceError::Io { path, source }
}
