//! Service configuration.
//!
//! Resolution order: built-in defaults, then an optional TOML file (explicit
//! path or `ROLLCALL_CONFIG`), then `ROLLCALL_*` environment variables.
//! An environment value that does not parse is ignored with a warning and
//! the previous layer wins.

use crate::augment::AugmentConfig;
use crate::detector::DetectorConfig;
use crate::matcher::DEFAULT_TOLERANCE;
use crate::trainer::TrainerConfig;
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub const CONFIG_ENV: &str = "ROLLCALL_CONFIG";
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.7;

const DETECTOR_MODEL: &str = "det_10g.onnx";
const ENCODER_MODEL: &str = "face_encoder_128.onnx";
const BACKBONE_WEIGHTS: &str = "vgg16_backbone.safetensors";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Root of the encoding store, training corpus and classifier artifacts.
    pub data_dir: PathBuf,
    /// Directory holding the ONNX models (default: `<data_dir>/models`).
    pub model_dir: Option<PathBuf>,
    /// Maximum Euclidean distance accepted as a classical match.
    pub tolerance: f32,
    /// Minimum arg-max probability accepted on the deep path.
    pub confidence_threshold: f32,
    pub detector: DetectorConfig,
    pub training: TrainerConfig,
}

/// On-disk shape of the TOML file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    data_dir: Option<PathBuf>,
    model_dir: Option<PathBuf>,
    tolerance: Option<f32>,
    confidence_threshold: Option<f32>,
    detector: Option<DetectorConfig>,
    training: TrainingSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct TrainingSection {
    epochs_head: Option<usize>,
    epochs_fine_tune: Option<usize>,
    lr_head: Option<f64>,
    lr_fine_tune: Option<f64>,
    batch_size: Option<usize>,
    unfreeze_layers: Option<usize>,
    validation_dir: Option<PathBuf>,
    pretrained_backbone: Option<PathBuf>,
    seed: Option<u64>,
    augment: Option<AugmentConfig>,
}

impl ServiceConfig {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            model_dir: None,
            tolerance: DEFAULT_TOLERANCE,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            detector: DetectorConfig::default(),
            training: TrainerConfig::default(),
        }
    }

    /// Resolve against the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Resolve with an injected environment lookup.
    pub fn resolve(
        file: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::with_data_dir(default_data_dir(&env));

        let file = file.map(Path::to_path_buf).or_else(|| env(CONFIG_ENV).map(PathBuf::from));
        if let Some(path) = file {
            let text = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            let parsed: ConfigFile = toml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
            config.apply_file(parsed);
            tracing::debug!(path = %path.display(), "config file applied");
        }

        config.apply_env(&env);
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(v) = file.data_dir {
            self.data_dir = v;
        }
        if let Some(v) = file.model_dir {
            self.model_dir = Some(v);
        }
        if let Some(v) = file.tolerance {
            self.tolerance = v;
        }
        if let Some(v) = file.confidence_threshold {
            self.confidence_threshold = v;
        }
        if let Some(v) = file.detector {
            self.detector = v;
        }

        let t = file.training;
        let training = &mut self.training;
        if let Some(v) = t.epochs_head {
            training.head.epochs = v;
        }
        if let Some(v) = t.epochs_fine_tune {
            training.fine_tune.epochs = v;
        }
        if let Some(v) = t.lr_head {
            training.head.learning_rate = v;
        }
        if let Some(v) = t.lr_fine_tune {
            training.fine_tune.learning_rate = v;
        }
        if let Some(v) = t.batch_size {
            training.batch_size = v;
        }
        if let Some(v) = t.unfreeze_layers {
            training.unfreeze_layers = v;
        }
        if t.validation_dir.is_some() {
            training.validation_dir = t.validation_dir;
        }
        if t.pretrained_backbone.is_some() {
            training.pretrained_backbone = t.pretrained_backbone;
        }
        if t.seed.is_some() {
            training.seed = t.seed;
        }
        if let Some(v) = t.augment {
            training.augment = v;
        }
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("ROLLCALL_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = env("ROLLCALL_MODEL_DIR") {
            self.model_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env("ROLLCALL_VALIDATION_DIR") {
            self.training.validation_dir = Some(PathBuf::from(v));
        }

        override_with(env, "ROLLCALL_TOLERANCE", &mut self.tolerance);
        override_with(env, "ROLLCALL_CONFIDENCE_THRESHOLD", &mut self.confidence_threshold);

        let training = &mut self.training;
        override_with(env, "ROLLCALL_EPOCHS_HEAD", &mut training.head.epochs);
        override_with(env, "ROLLCALL_EPOCHS_FINE_TUNE", &mut training.fine_tune.epochs);
        override_with(env, "ROLLCALL_LR_HEAD", &mut training.head.learning_rate);
        override_with(env, "ROLLCALL_LR_FINE_TUNE", &mut training.fine_tune.learning_rate);
        override_with(env, "ROLLCALL_BATCH_SIZE", &mut training.batch_size);
        override_with(env, "ROLLCALL_UNFREEZE_LAYERS", &mut training.unfreeze_layers);
        if let Some(seed) = parse_env(env, "ROLLCALL_SEED") {
            training.seed = Some(seed);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.tolerance.is_finite() && self.tolerance >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "tolerance {} must be a non-negative number",
                self.tolerance
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Invalid(format!(
                "confidence threshold {} must lie in [0, 1]",
                self.confidence_threshold
            )));
        }
        self.training
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn model_dir(&self) -> PathBuf {
        self.model_dir.clone().unwrap_or_else(|| self.data_dir.join("models"))
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir().join(DETECTOR_MODEL)
    }

    /// Path to the 128-d face embedding model.
    pub fn encoder_model_path(&self) -> PathBuf {
        self.model_dir().join(ENCODER_MODEL)
    }

    pub fn encodings_dir(&self) -> PathBuf {
        self.data_dir.join("encodings")
    }

    pub fn faces_dir(&self) -> PathBuf {
        self.data_dir.join("faces")
    }

    /// Shared path prefix of the classifier artifacts.
    pub fn classifier_prefix(&self) -> PathBuf {
        self.data_dir.join("classifier").join("face_classifier")
    }

    /// Trainer settings with the pretrained backbone defaulted into the model dir.
    pub fn trainer_config(&self) -> TrainerConfig {
        let mut config = self.training.clone();
        if config.pretrained_backbone.is_none() {
            config.pretrained_backbone = Some(self.model_dir().join(BACKBONE_WEIGHTS));
        }
        config
    }
}

/// `$XDG_DATA_HOME/rollcall`, falling back to `~/.local/share/rollcall`.
fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn parse_env<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

fn override_with<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(v) = parse_env(env, key) {
        *slot = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::resolve(None, env_of(&[("HOME", "/home/u")])).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/home/u/.local/share/rollcall"));
        assert_eq!(config.model_dir(), PathBuf::from("/home/u/.local/share/rollcall/models"));
        assert_eq!(config.tolerance, 0.6);
        assert_eq!(config.confidence_threshold, 0.7);
        assert_eq!(config.training.head.epochs, 15);
        assert_eq!(config.training.fine_tune.epochs, 5);
        assert_eq!(config.training.batch_size, 8);
        assert_eq!(config.training.unfreeze_layers, 4);
        assert_eq!(config.training.seed, None);
        assert_eq!(
            config.classifier_prefix(),
            PathBuf::from("/home/u/.local/share/rollcall/classifier/face_classifier")
        );
        assert_eq!(
            config.trainer_config().pretrained_backbone,
            Some(PathBuf::from("/home/u/.local/share/rollcall/models/vgg16_backbone.safetensors"))
        );
    }

    #[test]
    fn test_xdg_data_home() {
        let env = env_of(&[("XDG_DATA_HOME", "/xdg"), ("HOME", "/h")]);
        let config = ServiceConfig::resolve(None, env).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/xdg/rollcall"));
    }

    #[test]
    fn test_file_then_env_layering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        fs::write(
            &path,
            r#"
data_dir = "/srv/rollcall"
tolerance = 0.5
confidence_threshold = 0.8

[detector]
min_face_size = 40.0

[training]
epochs_head = 3
lr_head = 0.001
seed = 9

[training.augment]
horizontal_flip = false
"#,
        )
        .unwrap();

        let env = env_of(&[
            ("ROLLCALL_TOLERANCE", "0.45"),
            ("ROLLCALL_EPOCHS_FINE_TUNE", "2"),
            ("ROLLCALL_MODEL_DIR", "/opt/models"),
        ]);
        let config = ServiceConfig::resolve(Some(&path), env).unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/srv/rollcall"));
        assert_eq!(config.model_dir(), PathBuf::from("/opt/models"));
        assert_eq!(config.detector_model_path(), PathBuf::from("/opt/models/det_10g.onnx"));
        assert_eq!(config.tolerance, 0.45);
        assert_eq!(config.confidence_threshold, 0.8);
        assert_eq!(config.detector.min_face_size, 40.0);
        assert_eq!(config.detector.nms_threshold, 0.4);
        assert_eq!(config.training.head.epochs, 3);
        assert_eq!(config.training.head.learning_rate, 0.001);
        assert_eq!(config.training.fine_tune.epochs, 2);
        assert_eq!(config.training.seed, Some(9));
        assert!(!config.training.augment.horizontal_flip);
        assert_eq!(config.training.augment.rotation_degrees, 20.0);
    }

    #[test]
    fn test_config_path_from_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.toml");
        fs::write(&path, "tolerance = 0.3\n").unwrap();

        let env = env_of(&[("HOME", "/h"), (CONFIG_ENV, path.to_str().unwrap())]);
        assert_eq!(ServiceConfig::resolve(None, env).unwrap().tolerance, 0.3);
    }

    #[test]
    fn test_unparseable_env_keeps_previous_layer() {
        let env = env_of(&[
            ("HOME", "/h"),
            ("ROLLCALL_TOLERANCE", "close"),
            ("ROLLCALL_BATCH_SIZE", "-3"),
        ]);
        let config = ServiceConfig::resolve(None, env).unwrap();
        assert_eq!(config.tolerance, 0.6);
        assert_eq!(config.training.batch_size, 8);
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.toml");
        fs::write(&path, "tolerence = 0.3\n").unwrap();
        assert!(matches!(
            ServiceConfig::resolve(Some(&path), env_of(&[])),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ServiceConfig::resolve(Some(&dir.path().join("absent.toml")), env_of(&[])),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_fine_tune_rate_must_stay_below_head_rate() {
        let env = env_of(&[("HOME", "/h"), ("ROLLCALL_LR_FINE_TUNE", "0.001")]);
        assert!(matches!(ServiceConfig::resolve(None, env), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_threshold_range() {
        let env = env_of(&[("HOME", "/h"), ("ROLLCALL_CONFIDENCE_THRESHOLD", "1.5")]);
        assert!(matches!(ServiceConfig::resolve(None, env), Err(ConfigError::Invalid(_))));
    }
}
