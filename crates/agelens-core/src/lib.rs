//! agelens-core: face location and age bracket estimation.
//!
//! A Haar cascade finds frontal faces, the first region is cropped and
//! normalized into a 227x227 tensor, and an 8-class age network (optionally
//! a 2-class gender network) runs on it via ONNX Runtime.

pub mod cascade;
pub mod classifier;
pub mod detector;
pub mod model;
pub mod pipeline;
pub mod preprocess;
pub mod types;

pub use classifier::{AgeBracket, ClassLabel, Gender, Prediction};
pub use detector::{FaceLocator, LocatorParams};
pub use model::{initialize_runtime, LoadError, ModelArtifacts, ModelError, ModelHandle, ModelSlot};
pub use pipeline::{Analysis, PipelineError, RequestSequencer, Ticket};
pub use preprocess::PreprocessConfig;
pub use types::{FaceRegion, Image, PixelLayout};
