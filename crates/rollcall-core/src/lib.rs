//! rollcall-core: face enrollment and recognition engine for attendance.
//!
//! Two recognition paths share one detector:
//! - classical: a 128-d face encoding (ONNX, via ONNX Runtime) matched by
//!   Euclidean distance against the enrolled encodings;
//! - deep: a transfer-learning CNN classifier (candle) trained in two phases
//!   on the face crops collected at enrollment.
//!
//! [`RecognitionService`] is the entry point.

pub mod alignment;
pub mod augment;
pub mod classifier;
pub mod config;
pub mod corpus;
pub mod detector;
pub mod encoder;
pub mod imaging;
pub mod matcher;
pub mod persistence;
pub mod service;
pub mod store;
pub mod trainer;
pub mod types;

pub use classifier::{Architecture, ClassIndexMap, ClassifierModel, ModelState};
pub use config::ServiceConfig;
pub use service::{RecognitionError, RecognitionService, ServiceStatus};
pub use trainer::{TrainerConfig, TrainingReport};
pub use types::{BoundingBox, Encoding, EnrolledIdentity, RecognitionPath, RecognitionResult};
