//! Transfer-learning face classifier.
//!
//! A VGG-shaped convolutional backbone feeds global average pooling and a
//! dense head: `GAP → dense(1024, relu) → dense(512, relu) → dense(n, softmax)`.
//! All weights live in one [`VarMap`] under `backbone.conv{i}.*` and
//! `head.{fc1,fc2,out}.*`. Freezing is expressed by which variables are
//! handed to the optimizer, and activations are detached at the
//! frozen/trainable boundary so no gradient is computed for frozen layers.

use crate::imaging;
use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{Conv2d, Conv2dConfig, Linear, Module, VarBuilder, VarMap};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::PoisonError;
use thiserror::Error;

pub const DEFAULT_INPUT_SIZE: usize = 224;

const BACKBONE_PREFIX: &str = "backbone.";
const CONV_PREFIX: &str = "backbone.conv";
const HEAD_PREFIX: &str = "head.";

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("classifier needs at least one class")]
    NoClasses,
    #[error("invalid architecture: {0}")]
    InvalidArchitecture(String),
    #[error("illegal model state transition {from:?} -> {to:?}")]
    IllegalTransition { from: ModelState, to: ModelState },
    #[error("cannot unfreeze {requested} backbone layers, backbone has {available}")]
    Unfreeze { requested: usize, available: usize },
    #[error("pretrained backbone weights not found: {0}")]
    PretrainedNotFound(PathBuf),
    #[error("weights are missing tensor {0}")]
    MissingTensor(String),
    #[error("tensor {name} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),
}

/// One backbone layer: a 3×3 same-padded conv + relu with the given output
/// channels, or a 2×2 max-pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerSpec {
    Conv(usize),
    MaxPool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Architecture {
    /// Square input side in pixels.
    pub input_size: usize,
    pub backbone: Vec<LayerSpec>,
    /// Widths of the two hidden dense layers.
    pub head_units: [usize; 2],
}

impl Architecture {
    /// VGG16 feature extractor at 224×224 with the 1024/512 head.
    #[rustfmt::skip]
    pub fn vgg16() -> Self {
        use LayerSpec::{Conv, MaxPool};
        Self {
            input_size: DEFAULT_INPUT_SIZE,
            backbone: vec![
                Conv(64), Conv(64), MaxPool,
                Conv(128), Conv(128), MaxPool,
                Conv(256), Conv(256), Conv(256), MaxPool,
                Conv(512), Conv(512), Conv(512), MaxPool,
                Conv(512), Conv(512), Conv(512), MaxPool,
            ],
            head_units: [1024, 512],
        }
    }

    pub fn conv_layers(&self) -> usize {
        self.backbone.iter().filter(|l| matches!(l, LayerSpec::Conv(_))).count()
    }

    pub fn validate(&self) -> Result<(), ClassifierError> {
        let invalid = |msg: String| Err(ClassifierError::InvalidArchitecture(msg));

        if self.input_size == 0 {
            return invalid("input size must be positive".into());
        }
        if self.conv_layers() == 0 {
            return invalid("backbone needs at least one conv layer".into());
        }
        if self.backbone.iter().any(|l| *l == LayerSpec::Conv(0)) || self.head_units.contains(&0) {
            return invalid("layer widths must be positive".into());
        }
        let pools = self.backbone.iter().filter(|l| **l == LayerSpec::MaxPool).count();
        if self.input_size >> pools.min(usize::BITS as usize - 1) == 0 {
            return invalid(format!(
                "{pools} pooling layers shrink a {}px input to nothing",
                self.input_size
            ));
        }
        Ok(())
    }
}

impl Default for Architecture {
    fn default() -> Self {
        Self::vgg16()
    }
}

/// Bidirectional class index ↔ identity mapping, in index order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassIndexMap {
    classes: Vec<String>,
}

impl ClassIndexMap {
    pub fn new(classes: Vec<String>) -> Self {
        Self { classes }
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn identity(&self, index: usize) -> Option<&str> {
        self.classes.get(index).map(String::as_str)
    }

    pub fn index_of(&self, identity_id: &str) -> Option<usize> {
        self.classes.iter().position(|c| c == identity_id)
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }
}

/// Lifecycle of a classifier within one training run.
///
/// A model that does not exist yet is represented by `Option::None` at the
/// owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    /// Head freshly initialised, untrained.
    Built,
    /// Head trained on top of the frozen backbone.
    Trained,
    /// Last backbone layers unfrozen and retrained.
    FineTuned,
}

impl ModelState {
    pub fn is_trained(self) -> bool {
        matches!(self, ModelState::Trained | ModelState::FineTuned)
    }
}

/// Arg-max outcome of a prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class_index: usize,
    pub identity_id: String,
    pub probability: f32,
}

enum Block {
    Conv(Conv2d),
    Pool,
}

pub struct ClassifierModel {
    arch: Architecture,
    class_map: ClassIndexMap,
    state: ModelState,
    /// Number of trailing backbone conv layers that are trainable.
    unfrozen: usize,
    device: Device,
    varmap: VarMap,
    backbone: Vec<Block>,
    fc1: Linear,
    fc2: Linear,
    out: Linear,
}

impl ClassifierModel {
    /// Build a fresh model with randomly initialised weights and a frozen backbone.
    pub fn build(
        arch: Architecture,
        class_map: ClassIndexMap,
        device: &Device,
    ) -> Result<Self, ClassifierError> {
        if class_map.is_empty() {
            return Err(ClassifierError::NoClasses);
        }
        arch.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let conv_cfg = Conv2dConfig { padding: 1, ..Default::default() };
        let mut channels = 3;
        let mut conv_idx = 0;
        let mut backbone = Vec::with_capacity(arch.backbone.len());
        for layer in &arch.backbone {
            match *layer {
                LayerSpec::Conv(out_channels) => {
                    let conv = candle_nn::conv2d(
                        channels,
                        out_channels,
                        3,
                        conv_cfg,
                        vb.pp("backbone").pp(format!("conv{conv_idx}")),
                    )?;
                    backbone.push(Block::Conv(conv));
                    channels = out_channels;
                    conv_idx += 1;
                }
                LayerSpec::MaxPool => backbone.push(Block::Pool),
            }
        }

        let head = vb.pp("head");
        let [h1, h2] = arch.head_units;
        let fc1 = candle_nn::linear(channels, h1, head.pp("fc1"))?;
        let fc2 = candle_nn::linear(h1, h2, head.pp("fc2"))?;
        let out = candle_nn::linear(h2, class_map.len(), head.pp("out"))?;

        tracing::debug!(
            classes = class_map.len(),
            conv_layers = conv_idx,
            input_size = arch.input_size,
            "classifier built"
        );

        Ok(Self {
            arch,
            class_map,
            state: ModelState::Built,
            unfrozen: 0,
            device: device.clone(),
            varmap,
            backbone,
            fc1,
            fc2,
            out,
        })
    }

    /// Overwrite the backbone with pretrained weights from a safetensors file.
    ///
    /// Keys outside `backbone.` are ignored, so a full checkpoint works too.
    pub fn load_pretrained_backbone(&self, path: &Path) -> Result<(), ClassifierError> {
        if !path.exists() {
            return Err(ClassifierError::PretrainedNotFound(path.to_path_buf()));
        }
        let tensors = candle_core::safetensors::load(path, &self.device)?;
        let loaded = self.assign(&tensors, |name| name.starts_with(BACKBONE_PREFIX))?;
        tracing::info!(path = %path.display(), tensors = loaded, "pretrained backbone loaded");
        Ok(())
    }

    /// Copy of this model's weights and class map, reset to [`ModelState::Built`]
    /// with a frozen backbone, ready for another training run.
    pub fn fork_for_retraining(&self) -> Result<Self, ClassifierError> {
        let fork = Self::build(self.arch.clone(), self.class_map.clone(), &self.device)?;
        fork.assign(&self.snapshot(), |_| true)?;
        Ok(fork)
    }

    pub fn save_weights(&self, path: &Path) -> Result<(), ClassifierError> {
        self.varmap.save(path)?;
        Ok(())
    }

    pub fn set_weights(&self, tensors: &HashMap<String, Tensor>) -> Result<(), ClassifierError> {
        self.assign(tensors, |_| true)?;
        Ok(())
    }

    /// Move along the state machine: Built → Trained → FineTuned.
    pub fn advance(&mut self, to: ModelState) -> Result<(), ClassifierError> {
        let allowed = matches!(
            (self.state, to),
            (ModelState::Built, ModelState::Trained) | (ModelState::Trained, ModelState::FineTuned)
        );
        if !allowed {
            return Err(ClassifierError::IllegalTransition { from: self.state, to });
        }
        self.state = to;
        Ok(())
    }

    /// Restore a persisted state without replaying the transitions.
    pub(crate) fn restore(
        &mut self,
        state: ModelState,
        unfrozen: usize,
    ) -> Result<(), ClassifierError> {
        self.set_unfrozen(unfrozen)?;
        self.state = state;
        Ok(())
    }

    pub fn freeze_backbone(&mut self) {
        self.unfrozen = 0;
    }

    /// Make the last `k` backbone conv layers trainable.
    pub fn unfreeze_last(&mut self, k: usize) -> Result<(), ClassifierError> {
        self.set_unfrozen(k)
    }

    fn set_unfrozen(&mut self, k: usize) -> Result<(), ClassifierError> {
        let available = self.arch.conv_layers();
        if k > available {
            return Err(ClassifierError::Unfreeze { requested: k, available });
        }
        self.unfrozen = k;
        Ok(())
    }

    /// Variables the optimizer may update: the head plus any unfrozen conv layers.
    pub fn trainable_vars(&self) -> Vec<Var> {
        let first_trainable = self.arch.conv_layers() - self.unfrozen;
        let data = self.varmap.data().lock().unwrap_or_else(PoisonError::into_inner);

        let mut vars: Vec<(&String, &Var)> = data
            .iter()
            .filter(|(name, _)| {
                name.starts_with(HEAD_PREFIX)
                    || conv_index(name.as_str()).is_some_and(|i| i >= first_trainable)
            })
            .collect();
        vars.sort_by(|a, b| a.0.cmp(b.0));
        vars.into_iter().map(|(_, v)| v.clone()).collect()
    }

    /// Raw class scores for a `[N, 3, S, S]` batch.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor, ClassifierError> {
        let boundary = self.frozen_boundary();
        let mut x = input.clone();
        for (i, block) in self.backbone.iter().enumerate() {
            x = match block {
                Block::Conv(conv) => conv.forward(&x)?.relu()?,
                Block::Pool => x.max_pool2d(2)?,
            };
            if boundary == Some(i) {
                x = x.detach();
            }
        }

        let pooled = x.mean(D::Minus1)?.mean(D::Minus1)?;
        let hidden = self.fc1.forward(&pooled)?.relu()?;
        let hidden = self.fc2.forward(&hidden)?.relu()?;
        Ok(self.out.forward(&hidden)?)
    }

    /// Class probabilities for a `[N, 3, S, S]` batch, one row per sample.
    pub fn probabilities(&self, input: &Tensor) -> Result<Vec<Vec<f32>>, ClassifierError> {
        let logits = self.forward(input)?;
        Ok(candle_nn::ops::softmax(&logits, D::Minus1)?.to_vec2::<f32>()?)
    }

    /// Probability vector over the class map for one face crop.
    pub fn predict(&self, face: &RgbImage) -> Result<Vec<f32>, ClassifierError> {
        let input = self.batch(&[self.preprocess(face)])?;
        let mut rows = self.probabilities(&input)?;
        Ok(rows.pop().unwrap_or_default())
    }

    /// Arg-max class of [`predict`](Self::predict).
    pub fn classify(&self, face: &RgbImage) -> Result<Prediction, ClassifierError> {
        let probs = self.predict(face)?;
        let (class_index, probability) = argmax(&probs).ok_or(ClassifierError::NoClasses)?;
        let identity_id = self
            .class_map
            .identity(class_index)
            .ok_or(ClassifierError::NoClasses)?
            .to_string();
        Ok(Prediction { class_index, identity_id, probability })
    }

    /// Resize to the input size and lay out as CHW in [0, 1].
    pub fn preprocess(&self, face: &RgbImage) -> Vec<f32> {
        imaging::to_chw_unit(&imaging::resize_square(face, self.arch.input_size as u32))
    }

    /// Stack preprocessed samples into a `[N, 3, S, S]` tensor.
    pub fn batch(&self, samples: &[Vec<f32>]) -> Result<Tensor, ClassifierError> {
        let s = self.arch.input_size;
        let data: Vec<f32> = samples.iter().flatten().copied().collect();
        Ok(Tensor::from_vec(data, (samples.len(), 3, s, s), &self.device)?)
    }

    pub fn architecture(&self) -> &Architecture {
        &self.arch
    }

    pub fn class_map(&self) -> &ClassIndexMap {
        &self.class_map
    }

    pub fn num_classes(&self) -> usize {
        self.class_map.len()
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    pub fn unfrozen_layers(&self) -> usize {
        self.unfrozen
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Backbone position after which activations are detached, or `None`
    /// when the whole backbone is trainable.
    fn frozen_boundary(&self) -> Option<usize> {
        if self.unfrozen == 0 {
            return self.backbone.len().checked_sub(1);
        }
        let first_trainable = self.arch.conv_layers() - self.unfrozen;
        let position = self
            .arch
            .backbone
            .iter()
            .enumerate()
            .filter(|(_, l)| matches!(l, LayerSpec::Conv(_)))
            .nth(first_trainable)
            .map(|(pos, _)| pos)?;
        position.checked_sub(1)
    }

    fn snapshot(&self) -> HashMap<String, Tensor> {
        let data = self.varmap.data().lock().unwrap_or_else(PoisonError::into_inner);
        data.iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect()
    }

    /// Copy tensors into the variables whose names pass `filter`.
    fn assign(
        &self,
        tensors: &HashMap<String, Tensor>,
        filter: impl Fn(&str) -> bool,
    ) -> Result<usize, ClassifierError> {
        let data = self.varmap.data().lock().unwrap_or_else(PoisonError::into_inner);

        // Validate everything first so a bad file leaves the model untouched.
        let mut pending = Vec::new();
        for (name, var) in data.iter().filter(|(name, _)| filter(name.as_str())) {
            let src = tensors
                .get(name)
                .ok_or_else(|| ClassifierError::MissingTensor(name.clone()))?;
            if src.dims() != var.dims() {
                return Err(ClassifierError::ShapeMismatch {
                    name: name.clone(),
                    expected: var.dims().to_vec(),
                    found: src.dims().to_vec(),
                });
            }
            pending.push((var, src.to_dtype(DType::F32)?));
        }

        for (var, src) in &pending {
            var.set(src)?;
        }
        Ok(pending.len())
    }
}

/// `backbone.conv{i}.weight` → `i`.
fn conv_index(name: &str) -> Option<usize> {
    name.strip_prefix(CONV_PREFIX)?.split('.').next()?.parse().ok()
}

/// Index and value of the largest element; the first wins on ties.
pub fn argmax(values: &[f32]) -> Option<(usize, f32)> {
    values
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (i, v)| match best {
            Some((_, bv)) if bv >= v => best,
            _ => Some((i, v)),
        })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Rgb;

    pub(crate) fn tiny_arch() -> Architecture {
        Architecture {
            input_size: 16,
            backbone: vec![
                LayerSpec::Conv(4),
                LayerSpec::MaxPool,
                LayerSpec::Conv(8),
                LayerSpec::MaxPool,
                LayerSpec::Conv(8),
            ],
            head_units: [16, 8],
        }
    }

    fn classes(names: &[&str]) -> ClassIndexMap {
        ClassIndexMap::new(names.iter().map(|s| s.to_string()).collect())
    }

    fn tiny(names: &[&str]) -> ClassifierModel {
        ClassifierModel::build(tiny_arch(), classes(names), &Device::Cpu).unwrap()
    }

    fn var_values(model: &ClassifierModel, name: &str) -> Vec<f32> {
        let data = model.varmap.data().lock().unwrap();
        data[name].as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    fn face(seed: u8) -> RgbImage {
        RgbImage::from_fn(20, 20, |x, y| Rgb([seed.wrapping_mul(x as u8), y as u8 * 9, 200]))
    }

    #[test]
    fn test_vgg16_shape() {
        let arch = Architecture::vgg16();
        assert_eq!(arch.conv_layers(), 13);
        assert_eq!(arch.input_size, 224);
        assert!(arch.validate().is_ok());
    }

    #[test]
    fn test_invalid_architectures() {
        let mut arch = tiny_arch();
        arch.backbone = vec![LayerSpec::MaxPool];
        assert!(matches!(arch.validate(), Err(ClassifierError::InvalidArchitecture(_))));

        let mut arch = tiny_arch();
        arch.backbone = vec![LayerSpec::Conv(4); 1]
            .into_iter()
            .chain(vec![LayerSpec::MaxPool; 5])
            .collect();
        assert!(matches!(arch.validate(), Err(ClassifierError::InvalidArchitecture(_))));

        assert!(matches!(
            ClassifierModel::build(tiny_arch(), ClassIndexMap::new(vec![]), &Device::Cpu),
            Err(ClassifierError::NoClasses)
        ));
    }

    #[test]
    fn test_predict_is_a_distribution() {
        let model = tiny(&["alice", "bob", "carol"]);
        let probs = model.predict(&face(3)).unwrap();
        assert_eq!(probs.len(), 3);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));

        let prediction = model.classify(&face(3)).unwrap();
        assert_eq!(
            model.class_map().identity(prediction.class_index),
            Some(prediction.identity_id.as_str())
        );
    }

    #[test]
    fn test_state_machine() {
        let mut model = tiny(&["a", "b"]);
        assert_eq!(model.state(), ModelState::Built);
        assert!(matches!(
            model.advance(ModelState::FineTuned),
            Err(ClassifierError::IllegalTransition {
                from: ModelState::Built,
                to: ModelState::FineTuned,
            })
        ));
        model.advance(ModelState::Trained).unwrap();
        assert!(model.advance(ModelState::Trained).is_err());
        model.advance(ModelState::FineTuned).unwrap();
        assert!(model.advance(ModelState::Trained).is_err());
        assert!(model.state().is_trained());
    }

    #[test]
    fn test_trainable_vars_follow_freezing() {
        let mut model = tiny(&["a", "b"]);
        // Head only: three linear layers × (weight, bias).
        assert_eq!(model.trainable_vars().len(), 6);

        model.unfreeze_last(1).unwrap();
        assert_eq!(model.trainable_vars().len(), 8);
        model.unfreeze_last(3).unwrap();
        assert_eq!(model.trainable_vars().len(), 12);

        assert!(matches!(
            model.unfreeze_last(4),
            Err(ClassifierError::Unfreeze { requested: 4, available: 3 })
        ));
        model.freeze_backbone();
        assert_eq!(model.trainable_vars().len(), 6);
    }

    #[test]
    fn test_frozen_layers_receive_no_gradient() {
        let mut model = tiny(&["a", "b"]);
        model.unfreeze_last(1).unwrap();

        let input = model.batch(&[model.preprocess(&face(1)), model.preprocess(&face(2))]).unwrap();
        let targets = Tensor::new(&[0u32, 1u32], &Device::Cpu).unwrap();
        let logits = model.forward(&input).unwrap();
        let loss = candle_nn::loss::cross_entropy(&logits, &targets).unwrap();
        let grads = loss.backward().unwrap();

        let data = model.varmap.data().lock().unwrap();
        assert!(grads.get(data["backbone.conv0.weight"].as_tensor()).is_none());
        assert!(grads.get(data["backbone.conv1.weight"].as_tensor()).is_none());
        assert!(grads.get(data["backbone.conv2.weight"].as_tensor()).is_some());
        assert!(grads.get(data["head.out.weight"].as_tensor()).is_some());
    }

    #[test]
    fn test_fork_copies_weights_and_resets_state() {
        let mut model = tiny(&["a", "b"]);
        model.advance(ModelState::Trained).unwrap();
        model.unfreeze_last(2).unwrap();

        let fork = model.fork_for_retraining().unwrap();
        assert_eq!(fork.state(), ModelState::Built);
        assert_eq!(fork.unfrozen_layers(), 0);
        assert_eq!(fork.class_map(), model.class_map());

        let a = model.predict(&face(5)).unwrap();
        let b = fork.predict(&face(5)).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            approx::assert_abs_diff_eq!(x, y, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_pretrained_backbone_loading() {
        let dir = tempfile::tempdir().unwrap();
        let source = tiny(&["x", "y", "z"]);
        let path = dir.path().join("backbone.safetensors");
        source.save_weights(&path).unwrap();

        // Different class count: only the backbone is taken from the file.
        let target = tiny(&["a", "b"]);
        target.load_pretrained_backbone(&path).unwrap();
        assert_eq!(
            var_values(&target, "backbone.conv1.weight"),
            var_values(&source, "backbone.conv1.weight")
        );

        let mut wider = tiny_arch();
        wider.backbone[0] = LayerSpec::Conv(6);
        let mismatched = ClassifierModel::build(wider, classes(&["a", "b"]), &Device::Cpu).unwrap();
        assert!(matches!(
            mismatched.load_pretrained_backbone(&path),
            Err(ClassifierError::ShapeMismatch { .. })
        ));

        assert!(matches!(
            target.load_pretrained_backbone(&dir.path().join("missing.safetensors")),
            Err(ClassifierError::PretrainedNotFound(_))
        ));
    }

    #[test]
    fn test_argmax() {
        assert_eq!(argmax(&[0.1, 0.7, 0.2]), Some((1, 0.7)));
        assert_eq!(argmax(&[0.5, 0.5]), Some((0, 0.5)));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_conv_index() {
        assert_eq!(conv_index("backbone.conv12.weight"), Some(12));
        assert_eq!(conv_index("head.fc1.weight"), None);
    }
}
