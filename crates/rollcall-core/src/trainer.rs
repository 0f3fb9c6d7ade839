//! Two-phase transfer-learning trainer.
//!
//! Phase 1 trains the dense head over a frozen backbone. Phase 2 unfreezes
//! the last `k` backbone conv layers and continues with a fresh optimizer at
//! a lower learning rate. Both phases share one data pipeline: every epoch
//! shuffles the corpus and augments each sample on the fly.

use crate::augment::{augment, AugmentConfig};
use crate::classifier::{
    argmax, Architecture, ClassIndexMap, ClassifierError, ClassifierModel, ModelState,
};
use crate::corpus::{scan_dir, CorpusError, Sample, TrainingCorpus};
use crate::imaging::{self, DecodeError};
use candle_core::{Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use image::RgbImage;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Fewest identities a classifier can be trained on.
pub const MIN_IDENTITIES: usize = 2;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("training needs at least {MIN_IDENTITIES} identities with images, found {identities}")]
    InsufficientData { identities: usize },
    #[error("invalid training configuration: {0}")]
    InvalidConfig(String),
    #[error("loss diverged during {phase} epoch {epoch}")]
    Diverged { phase: TrainingPhase, epoch: usize },
    #[error("training aborted: {0}")]
    Aborted(String),
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error("unreadable training image {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: DecodeError,
    },
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingPhase {
    HeadTraining,
    FineTuning,
}

impl fmt::Display for TrainingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingPhase::HeadTraining => write!(f, "head training"),
            TrainingPhase::FineTuning => write!(f, "fine-tuning"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub learning_rate: f64,
    pub epochs: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainerConfig {
    pub architecture: Architecture,
    /// Safetensors file with `backbone.*` weights; random init when absent.
    pub pretrained_backbone: Option<PathBuf>,
    pub head: PhaseConfig,
    pub fine_tune: PhaseConfig,
    /// Trailing backbone conv layers unfrozen in phase 2.
    pub unfreeze_layers: usize,
    pub batch_size: usize,
    pub augment: AugmentConfig,
    /// Fixes shuffling and augmentation when set.
    pub seed: Option<u64>,
    /// Class-per-directory tree scored after training.
    pub validation_dir: Option<PathBuf>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            architecture: Architecture::vgg16(),
            pretrained_backbone: None,
            head: PhaseConfig { learning_rate: 1e-4, epochs: 15 },
            fine_tune: PhaseConfig { learning_rate: 1e-5, epochs: 5 },
            unfreeze_layers: 4,
            batch_size: 8,
            augment: AugmentConfig::default(),
            seed: None,
            validation_dir: None,
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<(), TrainError> {
        let invalid = |msg: String| Err(TrainError::InvalidConfig(msg));

        let (r1, r2) = (self.head.learning_rate, self.fine_tune.learning_rate);
        if !(r1 > 0.0 && r2 > 0.0) {
            return invalid(format!("learning rates must be positive (head {r1}, fine-tune {r2})"));
        }
        if r2 >= r1 {
            return invalid(format!(
                "fine-tune learning rate {r2} must be below head learning rate {r1}"
            ));
        }
        if self.head.epochs == 0 || self.fine_tune.epochs == 0 {
            return invalid("both phases need at least one epoch".into());
        }
        if self.batch_size == 0 {
            return invalid("batch size must be positive".into());
        }
        let conv_layers = self.architecture.conv_layers();
        if self.unfreeze_layers > conv_layers {
            return invalid(format!(
                "cannot unfreeze {} layers of a {conv_layers}-layer backbone",
                self.unfreeze_layers
            ));
        }
        self.architecture.validate()?;
        Ok(())
    }
}

/// Reported after each epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub phase: TrainingPhase,
    /// 1-based.
    pub epoch: usize,
    pub epochs: usize,
    pub mean_loss: f32,
    pub learning_rate: f64,
}

/// Receives per-epoch progress; returning an error aborts the run.
pub trait TrainingObserver: Send + Sync {
    fn on_epoch_end(&self, summary: &EpochSummary) -> Result<(), TrainError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseReport {
    pub phase: TrainingPhase,
    pub learning_rate: f64,
    pub epochs: usize,
    pub final_loss: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingReport {
    pub class_map: ClassIndexMap,
    pub samples: usize,
    pub phases: Vec<PhaseReport>,
    /// Accuracy on the un-augmented training corpus.
    pub accuracy: f32,
    pub validation_accuracy: Option<f32>,
    pub state: ModelState,
}

/// Resized image with its class index.
type Labeled = (RgbImage, usize);

pub struct Trainer {
    config: TrainerConfig,
    observer: Option<Arc<dyn TrainingObserver>>,
    device: Device,
}

impl Trainer {
    pub fn new(config: TrainerConfig) -> Self {
        Self { config, observer: None, device: Device::Cpu }
    }

    pub fn with_observer(mut self, observer: Arc<dyn TrainingObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Train a new model generation from the corpus.
    ///
    /// `active` is never modified. When it covers the same class set and
    /// `force_retrain` is false, training continues from a copy of its
    /// weights; otherwise a fresh model is built.
    pub fn run(
        &self,
        corpus: &TrainingCorpus,
        active: Option<&ClassifierModel>,
        force_retrain: bool,
    ) -> Result<(ClassifierModel, TrainingReport), TrainError> {
        self.config.validate()?;

        let index = corpus.scan()?;
        if index.identities.len() < MIN_IDENTITIES {
            return Err(TrainError::InsufficientData { identities: index.identities.len() });
        }
        let class_map = ClassIndexMap::new(index.identities);

        let mut model = self.base_model(&class_map, active, force_retrain)?;
        let data = self.load_samples(&index.samples, &class_map)?;
        tracing::info!(
            classes = class_map.len(),
            samples = data.len(),
            "training started"
        );

        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        model.freeze_backbone();
        let head = self.run_phase(
            &mut model,
            TrainingPhase::HeadTraining,
            self.config.head,
            &data,
            &mut rng,
        )?;
        model.advance(ModelState::Trained)?;

        model.unfreeze_last(self.config.unfreeze_layers)?;
        let fine = self.run_phase(
            &mut model,
            TrainingPhase::FineTuning,
            self.config.fine_tune,
            &data,
            &mut rng,
        )?;
        model.advance(ModelState::FineTuned)?;

        let accuracy = self.evaluate(&model, &data)?;
        let validation_accuracy = match &self.config.validation_dir {
            Some(dir) => self.validate_on(&model, dir)?,
            None => None,
        };

        tracing::info!(accuracy, validation_accuracy = ?validation_accuracy, "training complete");

        let report = TrainingReport {
            class_map: model.class_map().clone(),
            samples: data.len(),
            phases: vec![head, fine],
            accuracy,
            validation_accuracy,
            state: model.state(),
        };
        Ok((model, report))
    }

    fn base_model(
        &self,
        class_map: &ClassIndexMap,
        active: Option<&ClassifierModel>,
        force_retrain: bool,
    ) -> Result<ClassifierModel, TrainError> {
        if let Some(active) = active {
            let compatible = active.class_map() == class_map
                && *active.architecture() == self.config.architecture;
            if !force_retrain && compatible {
                tracing::info!("continuing from active model weights");
                return Ok(active.fork_for_retraining()?);
            }
        }

        let model = ClassifierModel::build(
            self.config.architecture.clone(),
            class_map.clone(),
            &self.device,
        )?;
        match &self.config.pretrained_backbone {
            Some(path) if path.exists() => model.load_pretrained_backbone(path)?,
            Some(path) => tracing::warn!(
                path = %path.display(),
                "pretrained backbone not found, using random initialisation"
            ),
            None => {
                tracing::warn!("no pretrained backbone configured, using random initialisation")
            }
        }
        Ok(model)
    }

    fn load_samples(
        &self,
        samples: &[Sample],
        class_map: &ClassIndexMap,
    ) -> Result<Vec<Labeled>, TrainError> {
        let size = self.config.architecture.input_size as u32;
        let mut data = Vec::with_capacity(samples.len());
        for sample in samples {
            let Some(label) = class_map.index_of(&sample.identity_id) else {
                tracing::warn!(
                    identity = %sample.identity_id,
                    "skipping sample of unknown identity"
                );
                continue;
            };
            let image = imaging::open_image(&sample.path)
                .map_err(|source| TrainError::Decode { path: sample.path.clone(), source })?;
            data.push((imaging::resize_square(&image, size), label));
        }
        Ok(data)
    }

    fn run_phase(
        &self,
        model: &mut ClassifierModel,
        phase: TrainingPhase,
        params: PhaseConfig,
        data: &[Labeled],
        rng: &mut StdRng,
    ) -> Result<PhaseReport, TrainError> {
        let vars = model.trainable_vars();
        tracing::info!(
            %phase,
            learning_rate = params.learning_rate,
            epochs = params.epochs,
            trainable_tensors = vars.len(),
            "phase started"
        );

        let mut optimizer = AdamW::new(
            vars,
            ParamsAdamW {
                lr: params.learning_rate,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;

        let mut order: Vec<usize> = (0..data.len()).collect();
        let mut final_loss = f32::NAN;

        for epoch in 1..=params.epochs {
            order.shuffle(rng);
            let mut total = 0.0f32;
            let mut batches = 0usize;

            for chunk in order.chunks(self.config.batch_size) {
                let inputs: Vec<Vec<f32>> = chunk
                    .iter()
                    .map(|&i| imaging::to_chw_unit(&augment(&data[i].0, &self.config.augment, rng)))
                    .collect();
                let x = model.batch(&inputs)?;
                let y = Tensor::from_iter(chunk.iter().map(|&i| data[i].1 as u32), model.device())?;

                let logits = model.forward(&x)?;
                let loss = candle_nn::loss::cross_entropy(&logits, &y)?;
                let value = loss.to_scalar::<f32>()?;
                if !value.is_finite() {
                    return Err(TrainError::Diverged { phase, epoch });
                }
                optimizer.backward_step(&loss)?;

                total += value;
                batches += 1;
            }

            let mean_loss = total / batches.max(1) as f32;
            tracing::info!(
                %phase,
                epoch,
                epochs = params.epochs,
                loss = mean_loss,
                "epoch complete"
            );

            if let Some(observer) = &self.observer {
                observer.on_epoch_end(&EpochSummary {
                    phase,
                    epoch,
                    epochs: params.epochs,
                    mean_loss,
                    learning_rate: params.learning_rate,
                })?;
            }
            final_loss = mean_loss;
        }

        Ok(PhaseReport {
            phase,
            learning_rate: params.learning_rate,
            epochs: params.epochs,
            final_loss,
        })
    }

    /// Fraction of samples whose arg-max class equals the label.
    fn evaluate(&self, model: &ClassifierModel, data: &[Labeled]) -> Result<f32, TrainError> {
        if data.is_empty() {
            return Ok(0.0);
        }
        let mut correct = 0usize;
        for chunk in data.chunks(self.config.batch_size) {
            let inputs: Vec<Vec<f32>> =
                chunk.iter().map(|(img, _)| imaging::to_chw_unit(img)).collect();
            let rows = model.probabilities(&model.batch(&inputs)?)?;
            correct += rows
                .iter()
                .zip(chunk)
                .filter(|(probs, (_, label))| argmax(probs).map(|(i, _)| i) == Some(*label))
                .count();
        }
        Ok(correct as f32 / data.len() as f32)
    }

    fn validate_on(
        &self,
        model: &ClassifierModel,
        dir: &std::path::Path,
    ) -> Result<Option<f32>, TrainError> {
        let index = scan_dir(dir)?;
        let unknown: BTreeSet<&str> = index
            .identities
            .iter()
            .map(String::as_str)
            .filter(|id| model.class_map().index_of(id).is_none())
            .collect();
        if !unknown.is_empty() {
            tracing::warn!(
                identities = ?unknown,
                "validation identities unknown to the model are skipped"
            );
        }

        let known: Vec<Sample> = index
            .samples
            .into_iter()
            .filter(|s| !unknown.contains(s.identity_id.as_str()))
            .collect();
        if known.is_empty() {
            tracing::warn!(dir = %dir.display(), "validation corpus has no usable samples");
            return Ok(None);
        }

        let data = self.load_samples(&known, model.class_map())?;
        Ok(Some(self.evaluate(model, &data)?))
    }
}
