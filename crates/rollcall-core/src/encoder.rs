//! Face encoding.
//!
//! [`OnnxFaceEncoder`] runs a 128-dimensional face-embedding model
//! (SFace-compatible, 112×112 RGB input) over an aligned face crop.

use crate::alignment;
use crate::imaging;
use crate::types::{BoundingBox, Encoding, ENCODING_DIM};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

const ENCODER_INPUT_SIZE: u32 = 112;
const ENCODER_MEAN: f32 = 127.5;
const ENCODER_STD: f32 = 127.5;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face region lies outside the image")]
    RegionOutOfBounds,
    #[error("encoder session lock poisoned")]
    Poisoned,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Produces a fixed-length descriptor for a detected face.
pub trait FaceEncoder: Send + Sync {
    fn encode(&self, image: &RgbImage, region: &BoundingBox) -> Result<Encoding, EncoderError>;
}

pub struct OnnxFaceEncoder {
    session: Mutex<Session>,
}

impl OnnxFaceEncoder {
    pub fn load(model_path: &Path) -> Result<Self, EncoderError> {
        if !model_path.exists() {
            return Err(EncoderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded face encoder model"
        );

        Ok(Self { session: Mutex::new(session) })
    }

    /// Aligned crop when landmarks are available, plain crop-and-resize otherwise.
    fn face_chip(image: &RgbImage, region: &BoundingBox) -> Result<RgbImage, EncoderError> {
        match &region.landmarks {
            Some(landmarks) => Ok(alignment::align_face(image, landmarks, ENCODER_INPUT_SIZE)),
            None => {
                let crop =
                    imaging::crop_face(image, region).ok_or(EncoderError::RegionOutOfBounds)?;
                Ok(imaging::resize_square(&crop, ENCODER_INPUT_SIZE))
            }
        }
    }

    /// NCHW float tensor with symmetric normalisation.
    fn preprocess(chip: &RgbImage) -> Array4<f32> {
        let size = ENCODER_INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in chip.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] =
                    (pixel[c] as f32 - ENCODER_MEAN) / ENCODER_STD;
            }
        }
        tensor
    }
}

impl FaceEncoder for OnnxFaceEncoder {
    fn encode(&self, image: &RgbImage, region: &BoundingBox) -> Result<Encoding, EncoderError> {
        let chip = Self::face_chip(image, region)?;
        let input = Self::preprocess(&chip);

        let raw: Vec<f32> = {
            let mut session = self.session.lock().map_err(|_| EncoderError::Poisoned)?;
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            let (_, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| EncoderError::InferenceFailed(format!("embedding extraction: {e}")))?;
            data.to_vec()
        };

        if raw.len() != ENCODING_DIM {
            return Err(EncoderError::InferenceFailed(format!(
                "expected {ENCODING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(EncoderError::InferenceFailed("embedding has non-finite components".into()));
        }
        Ok(Encoding::new(l2_normalize(raw)))
    }
}

/// [`OnnxFaceEncoder`] that loads its model on first use.
pub struct LazyOnnxFaceEncoder {
    model_path: PathBuf,
    loaded: Mutex<Option<Arc<OnnxFaceEncoder>>>,
}

impl LazyOnnxFaceEncoder {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            loaded: Mutex::new(None),
        }
    }

    fn encoder(&self) -> Result<Arc<OnnxFaceEncoder>, EncoderError> {
        let mut slot = self.loaded.lock().map_err(|_| EncoderError::Poisoned)?;
        if let Some(encoder) = slot.as_ref() {
            return Ok(Arc::clone(encoder));
        }
        let encoder = Arc::new(OnnxFaceEncoder::load(&self.model_path)?);
        *slot = Some(Arc::clone(&encoder));
        Ok(encoder)
    }
}

impl FaceEncoder for LazyOnnxFaceEncoder {
    fn encode(&self, image: &RgbImage, region: &BoundingBox) -> Result<Encoding, EncoderError> {
        self.encoder()?.encode(image, region)
    }
}

fn l2_normalize(mut values: Vec<f32>) -> Vec<f32> {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|v| *v /= norm);
    }
    values
}
