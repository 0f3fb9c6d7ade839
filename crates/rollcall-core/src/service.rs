//! Recognition service: the explicit context object tying detection,
//! encoding, the encoding store, the training corpus and the classifier
//! together.
//!
//! Locking:
//! - The encoding store sits behind a reader-writer lock. Recognitions read in
//!   parallel; enrollment takes the write lock only for the store mutation.
//! - The classifier sits behind its own reader-writer lock. Training holds the
//!   write lock for the whole run (train, save, swap). A deep-path request
//!   that finds it held does not wait and is served by the classical path.
//! - Poisoned locks are recovered. Every mutation reaches disk before memory.

use crate::classifier::{ClassifierError, ClassifierModel, ModelState};
use crate::config::{ConfigError, ServiceConfig};
use crate::corpus::{CorpusError, TrainingCorpus};
use crate::detector::{DetectorError, FaceDetector, LazyScrfdDetector, ScrfdDetector};
use crate::encoder::{EncoderError, FaceEncoder, LazyOnnxFaceEncoder, OnnxFaceEncoder};
use crate::imaging::{self, DecodeError};
use crate::persistence::{self, PersistenceError};
use crate::store::{EncodingStore, StoreError};
use crate::trainer::{TrainError, Trainer, TrainingObserver, TrainingReport};
use crate::types::{
    validate_identity_id, BoundingBox, EnrolledIdentity, InvalidIdentity, RecognitionPath,
    RecognitionResult, ENCODING_DIM,
};
use candle_core::Device;
use image::RgbImage;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("no face detected")]
    NoFace,
    #[error(transparent)]
    InvalidIdentity(#[from] InvalidIdentity),
    #[error("invalid encoding: expected {expected} dimensions, got {actual}")]
    InvalidEncoding { expected: usize, actual: usize },
    #[error("training needs at least 2 identities with images, found {identities}")]
    InsufficientData { identities: usize },
    #[error("training failed: {0}")]
    Training(#[source] TrainError),
    #[error("model artifacts: {0}")]
    ModelLoad(#[from] PersistenceError),
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Encoder(#[from] EncoderError),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<StoreError> for RecognitionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidEncoding { expected, actual } => {
                RecognitionError::InvalidEncoding { expected, actual }
            }
            StoreError::InvalidIdentity(e) => RecognitionError::InvalidIdentity(e),
            other => RecognitionError::Store(other),
        }
    }
}

impl From<TrainError> for RecognitionError {
    fn from(e: TrainError) -> Self {
        match e {
            TrainError::InsufficientData { identities } => {
                RecognitionError::InsufficientData { identities }
            }
            other => RecognitionError::Training(other),
        }
    }
}

/// Decision thresholds and artifact location.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSettings {
    pub tolerance: f32,
    pub confidence_threshold: f32,
    /// Shared path prefix of the classifier artifacts.
    pub model_prefix: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub enrolled: usize,
    /// `None` when no classifier is loaded.
    pub model_state: Option<ModelState>,
    pub classes: usize,
    /// A training run currently holds the classifier.
    pub training: bool,
    pub tolerance: f32,
    pub confidence_threshold: f32,
}

pub struct RecognitionService {
    detector: Box<dyn FaceDetector>,
    encoder: Box<dyn FaceEncoder>,
    store: RwLock<EncodingStore>,
    corpus: TrainingCorpus,
    model: RwLock<Option<ClassifierModel>>,
    trainer: Trainer,
    settings: ServiceSettings,
}

impl RecognitionService {
    pub fn new(
        detector: Box<dyn FaceDetector>,
        encoder: Box<dyn FaceEncoder>,
        store: EncodingStore,
        corpus: TrainingCorpus,
        model: Option<ClassifierModel>,
        trainer: Trainer,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            detector,
            encoder,
            store: RwLock::new(store),
            corpus,
            model: RwLock::new(model),
            trainer,
            settings,
        }
    }

    /// Load the ONNX models (fail-fast) and open everything else.
    pub fn from_config(config: &ServiceConfig) -> Result<Self, RecognitionError> {
        let detector = ScrfdDetector::load(&config.detector_model_path(), config.detector.clone())?;
        let encoder = OnnxFaceEncoder::load(&config.encoder_model_path())?;
        Self::open(config, Box::new(detector), Box::new(encoder))
    }

    /// Like [`from_config`](Self::from_config), but the ONNX models load on
    /// the first detection. Listing, removal, status and training never
    /// touch them.
    pub fn open_lazy(config: &ServiceConfig) -> Result<Self, RecognitionError> {
        let detector =
            LazyScrfdDetector::new(config.detector_model_path(), config.detector.clone());
        let encoder = LazyOnnxFaceEncoder::new(config.encoder_model_path());
        Self::open(config, Box::new(detector), Box::new(encoder))
    }

    /// Open the store, corpus and classifier under the configured data dir
    /// with the given detector and encoder.
    ///
    /// A missing or unusable classifier leaves the deep path unavailable
    /// rather than failing.
    pub fn open(
        config: &ServiceConfig,
        detector: Box<dyn FaceDetector>,
        encoder: Box<dyn FaceEncoder>,
    ) -> Result<Self, RecognitionError> {
        config.validate()?;
        let store = EncodingStore::open(config.encodings_dir())?;
        let corpus = TrainingCorpus::open(config.faces_dir())?;
        let model_prefix = config.classifier_prefix();
        let model = load_classifier(&model_prefix);

        let settings = ServiceSettings {
            tolerance: config.tolerance,
            confidence_threshold: config.confidence_threshold,
            model_prefix,
        };
        Ok(Self::new(
            detector,
            encoder,
            store,
            corpus,
            model,
            Trainer::new(config.trainer_config()),
            settings,
        ))
    }

    /// Attach a per-epoch training observer.
    pub fn with_training_observer(mut self, observer: Arc<dyn TrainingObserver>) -> Self {
        self.trainer = self.trainer.with_observer(observer);
        self
    }

    /// Enroll the highest-confidence face in `image` under `identity_id`.
    ///
    /// Storing the encoding is the success criterion. The face crop is then
    /// added to the training corpus on a best-effort basis: a failure there is
    /// logged and shows up as `source_crop_path == None`.
    pub fn enroll(
        &self,
        identity_id: &str,
        image: &RgbImage,
    ) -> Result<EnrolledIdentity, RecognitionError> {
        validate_identity_id(identity_id)?;
        let face = self.primary_face(image)?;
        let encoding = self.encoder.encode(image, &face)?;

        let mut record = write_lock(&self.store).enroll(identity_id, encoding)?.clone();

        match self.persist_crop(identity_id, image, &face) {
            Ok(path) => record.source_crop_path = Some(path),
            Err(e) => tracing::warn!(
                identity = identity_id,
                error = %e,
                "face crop not added to training corpus"
            ),
        }

        tracing::info!(
            identity = identity_id,
            crop = record.source_crop_path.is_some(),
            "identity enrolled"
        );
        Ok(record)
    }

    pub fn enroll_bytes(
        &self,
        identity_id: &str,
        bytes: &[u8],
    ) -> Result<EnrolledIdentity, RecognitionError> {
        self.enroll(identity_id, &imaging::decode(bytes)?)
    }

    /// Identify the face(s) in `image`.
    ///
    /// With `deep` set and a trained classifier available, each detected
    /// region is classified and the first whose arg-max probability reaches
    /// the confidence threshold wins. Otherwise, including when a training run
    /// holds the classifier, the classical encoder + matcher path answers.
    /// The result always comes from exactly one path.
    pub fn recognize(
        &self,
        image: &RgbImage,
        deep: bool,
    ) -> Result<RecognitionResult, RecognitionError> {
        let faces = self.detect(image)?;

        if deep {
            let guard = match self.model.try_read() {
                Ok(guard) => Some(guard),
                Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {
                    tracing::info!("classifier busy training, serving classical path");
                    None
                }
            };
            match guard.as_deref() {
                Some(Some(model)) if model.state().is_trained() => {
                    if let Some(result) = self.recognize_deep(model, image, &faces)? {
                        return Ok(result);
                    }
                    tracing::debug!(
                        threshold = self.settings.confidence_threshold,
                        "no region reached the confidence threshold, falling back to classical path"
                    );
                }
                Some(_) => tracing::debug!("no trained classifier loaded, serving classical path"),
                None => {}
            }
        }

        self.recognize_classical(image, &faces)
    }

    pub fn recognize_bytes(
        &self,
        bytes: &[u8],
        deep: bool,
    ) -> Result<RecognitionResult, RecognitionError> {
        self.recognize(&imaging::decode(bytes)?, deep)
    }

    /// Train a new classifier generation, persist it and make it active.
    ///
    /// Holds the classifier write lock throughout. On any failure the
    /// previously active model stays in place.
    pub fn train(&self, force_retrain: bool) -> Result<TrainingReport, RecognitionError> {
        let mut slot = write_lock(&self.model);

        let (model, report) = self.trainer.run(&self.corpus, slot.as_ref(), force_retrain)?;
        persistence::save(&model, &self.settings.model_prefix)?;

        *slot = Some(model);
        tracing::info!(
            classes = report.class_map.len(),
            accuracy = report.accuracy,
            "classifier generation activated"
        );
        Ok(report)
    }

    /// Delete an enrolled identity: its training crops first, then its
    /// encoding. The next training run no longer sees it as a class.
    ///
    /// Returns whether the identity had an encoding. The active classifier is
    /// left as is until it is retrained.
    pub fn remove(&self, identity_id: &str) -> Result<bool, RecognitionError> {
        validate_identity_id(identity_id)?;
        self.corpus.remove_identity(identity_id)?;
        Ok(write_lock(&self.store).remove(identity_id)?)
    }

    /// Enrolled identity ids in lexicographic order.
    pub fn identities(&self) -> Vec<String> {
        read_lock(&self.store).identities().map(str::to_string).collect()
    }

    pub fn status(&self) -> ServiceStatus {
        let enrolled = read_lock(&self.store).len();
        let (model_state, classes, training) = match self.model.try_read() {
            Ok(guard) => model_summary(&guard),
            Err(TryLockError::Poisoned(poisoned)) => model_summary(&poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => (None, 0, true),
        };
        ServiceStatus {
            enrolled,
            model_state,
            classes,
            training,
            tolerance: self.settings.tolerance,
            confidence_threshold: self.settings.confidence_threshold,
        }
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, RecognitionError> {
        let faces = self.detector.detect(image)?;
        if faces.is_empty() {
            return Err(RecognitionError::NoFace);
        }
        tracing::debug!(faces = faces.len(), "faces detected");
        Ok(faces)
    }

    /// Highest-confidence detection; the earliest wins a tie.
    fn primary_face(&self, image: &RgbImage) -> Result<BoundingBox, RecognitionError> {
        self.detect(image)?
            .into_iter()
            .reduce(|best, face| if face.confidence > best.confidence { face } else { best })
            .ok_or(RecognitionError::NoFace)
    }

    fn persist_crop(
        &self,
        identity_id: &str,
        image: &RgbImage,
        face: &BoundingBox,
    ) -> Result<PathBuf, RecognitionError> {
        let crop = imaging::crop_face(image, face).ok_or(EncoderError::RegionOutOfBounds)?;
        let path = self.corpus.add_crop(identity_id, &crop)?;
        write_lock(&self.store).attach_crop(identity_id, path.clone())?;
        Ok(path)
    }

    fn recognize_deep(
        &self,
        model: &ClassifierModel,
        image: &RgbImage,
        faces: &[BoundingBox],
    ) -> Result<Option<RecognitionResult>, RecognitionError> {
        for face in faces {
            let Some(crop) = imaging::crop_face(image, face) else {
                continue;
            };
            let prediction = model.classify(&crop)?;
            tracing::debug!(
                identity = %prediction.identity_id,
                probability = prediction.probability,
                "deep prediction"
            );
            if prediction.probability >= self.settings.confidence_threshold {
                return Ok(Some(RecognitionResult::matched(
                    prediction.identity_id,
                    prediction.probability,
                    RecognitionPath::Deep,
                    Some(face.clone()),
                )));
            }
        }
        Ok(None)
    }

    fn recognize_classical(
        &self,
        image: &RgbImage,
        faces: &[BoundingBox],
    ) -> Result<RecognitionResult, RecognitionError> {
        let face = faces
            .iter()
            .reduce(|best, face| if face.confidence > best.confidence { face } else { best })
            .ok_or(RecognitionError::NoFace)?;
        let encoding = self.encoder.encode(image, face)?;
        if encoding.dim() != ENCODING_DIM {
            return Err(RecognitionError::InvalidEncoding {
                expected: ENCODING_DIM,
                actual: encoding.dim(),
            });
        }

        let matched = read_lock(&self.store).match_encoding(&encoding, self.settings.tolerance);
        tracing::debug!(distance = ?matched.distance, matched = matched.matched, "classical match");
        Ok(matched.into_recognition(Some(face.clone())))
    }
}

fn load_classifier(prefix: &std::path::Path) -> Option<ClassifierModel> {
    match persistence::load(prefix, &Device::Cpu) {
        Ok(model) => Some(model),
        Err(PersistenceError::Missing(path)) => {
            tracing::info!(path = %path.display(), "no trained classifier, deep path unavailable");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "classifier artifacts unusable, deep path unavailable");
            None
        }
    }
}

fn model_summary(model: &Option<ClassifierModel>) -> (Option<ModelState>, usize, bool) {
    match model {
        Some(m) => (Some(m.state()), m.num_classes(), false),
        None => (None, 0, false),
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
