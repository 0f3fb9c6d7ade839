use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Dimensionality of every face encoding held by the store.
pub const ENCODING_DIM: usize = 128;

const MAX_IDENTITY_LEN: usize = 128;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Integer pixel rectangle `(x, y, w, h)` clipped to an image of the given size.
    ///
    /// Returns `None` when nothing of the box lies inside the image.
    pub fn pixel_rect(&self, image_width: u32, image_height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0.0).floor();
        let y0 = self.y.max(0.0).floor();
        let x1 = (self.x + self.width).min(image_width as f32).ceil();
        let y1 = (self.y + self.height).min(image_height as f32).ceil();

        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
    }
}

/// Face encoding vector produced by a [`FaceEncoder`](crate::encoder::FaceEncoder).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Encoding {
    pub values: Vec<f32>,
}

impl Encoding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance between two encodings.
    ///
    /// Both encodings are expected to share a dimensionality; extra trailing
    /// components of the longer one are ignored.
    pub fn euclidean_distance(&self, other: &Encoding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// A stored identity with its reference encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledIdentity {
    pub identity_id: String,
    pub encoding: Encoding,
    /// Face crop written to the training corpus, when that write succeeded.
    pub source_crop_path: Option<PathBuf>,
    pub enrolled_at: String,
}

/// Which engine produced a [`RecognitionResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionPath {
    Classical,
    Deep,
}

/// Outcome of a recognition request.
///
/// A negative outcome (`recognized == false`) is a normal result, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub recognized: bool,
    pub identity_id: Option<String>,
    /// Match strength in [0, 1]. Not a calibrated probability on the classical path.
    pub confidence: Option<f32>,
    pub path: RecognitionPath,
    /// Face region the decision was made on.
    pub region: Option<BoundingBox>,
}

impl RecognitionResult {
    pub fn matched(
        identity_id: String,
        confidence: f32,
        path: RecognitionPath,
        region: Option<BoundingBox>,
    ) -> Self {
        Self {
            recognized: true,
            identity_id: Some(identity_id),
            confidence: Some(confidence.clamp(0.0, 1.0)),
            path,
            region,
        }
    }

    pub fn unrecognized(path: RecognitionPath) -> Self {
        Self {
            recognized: false,
            identity_id: None,
            confidence: None,
            path,
            region: None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid identity id {0:?}: use 1-128 of [A-Za-z0-9._-], not starting with '.'")]
pub struct InvalidIdentity(pub String);

/// Identity ids double as file and directory names, so only a conservative
/// character set is accepted.
pub fn validate_identity_id(id: &str) -> Result<(), InvalidIdentity> {
    let valid = !id.is_empty()
        && id.len() <= MAX_IDENTITY_LEN
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(InvalidIdentity(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 1.0, landmarks: None }
    }

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Encoding::new(vec![0.25, -0.5, 1.0]);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_euclidean_distance_known() {
        let a = Encoding::new(vec![0.0, 0.0]);
        let b = Encoding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_pixel_rect_inside() {
        assert_eq!(bbox(10.2, 5.0, 20.0, 30.5).pixel_rect(100, 100), Some((10, 5, 21, 31)));
    }

    #[test]
    fn test_pixel_rect_clipped() {
        assert_eq!(bbox(-10.0, -10.0, 30.0, 30.0).pixel_rect(15, 100), Some((0, 0, 15, 20)));
    }

    #[test]
    fn test_pixel_rect_outside() {
        assert_eq!(bbox(200.0, 0.0, 10.0, 10.0).pixel_rect(100, 100), None);
        assert_eq!(bbox(0.0, 0.0, 0.0, 10.0).pixel_rect(100, 100), None);
    }

    #[test]
    fn test_matched_clamps_confidence() {
        let r = RecognitionResult::matched("a".into(), 1.5, RecognitionPath::Classical, None);
        assert_eq!(r.confidence, Some(1.0));
        let r = RecognitionResult::matched("a".into(), -0.2, RecognitionPath::Classical, None);
        assert_eq!(r.confidence, Some(0.0));
    }

    #[test]
    fn test_identity_validation() {
        assert!(validate_identity_id("alice").is_ok());
        assert!(validate_identity_id("emp-0042_b.v2").is_ok());
        assert!(validate_identity_id("").is_err());
        assert!(validate_identity_id(".hidden").is_err());
        assert!(validate_identity_id("../etc").is_err());
        assert!(validate_identity_id("a/b").is_err());
        assert!(validate_identity_id("with space").is_err());
        assert!(validate_identity_id(&"x".repeat(129)).is_err());
    }
}
