//! Classifier model loading via ONNX Runtime.
//!
//! A model is two artifacts: an ONNX graph (topology) and the external-data
//! file holding its initializers (weights). Both are read into memory and the
//! weights are handed to ONNX Runtime under their file name, so the session
//! never resolves external data from disk on its own. Loading finishes with a
//! probe forward pass, so a [`ModelHandle`] that exists is known to produce an
//! output of the declared length.

use crate::preprocess::{INPUT_CHANNELS, INPUT_SIZE};
use crate::types::Tensor;
use ort::environment::Environment;
use ort::session::Session;
use ort::value::TensorRef;
use serde::Serialize;
use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use thiserror::Error;

const RUNTIME_NAME: &str = "agelens";

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("model artifact not found: {0}")]
    NotFound(String),
    #[error("malformed model topology {path}: {reason}")]
    MalformedTopology { path: String, reason: String },
    #[error("incompatible model weights {path}: {reason}")]
    IncompatibleWeights { path: String, reason: String },
    #[error("model output has {actual} classes, expected {expected}")]
    ShapeMismatch { expected: usize, actual: usize },
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model {0} is not available")]
    Unavailable(String),
    #[error("model produced {actual} scores, expected {expected}")]
    OutputShape { expected: usize, actual: usize },
    #[error("model produced NaN scores")]
    InvalidScores,
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Set up the process-wide inference runtime. Safe to call repeatedly.
pub fn initialize_runtime() {
    static RUNTIME: OnceLock<Option<Environment>> = OnceLock::new();
    RUNTIME.get_or_init(|| match ort::init().with_name(RUNTIME_NAME).build() {
        Ok(environment) => {
            tracing::debug!(name = RUNTIME_NAME, "inference runtime initialized");
            Some(environment)
        }
        Err(e) => {
            tracing::warn!(
                name = RUNTIME_NAME,
                error = %e,
                "inference runtime initialization failed, sessions use the default environment"
            );
            None
        }
    });
}

/// A forward pass from a preprocessed tensor to raw class scores.
pub trait Network: Send + Sync {
    fn forward(&self, input: &Tensor) -> Result<Vec<f32>, ModelError>;
}

/// ONNX Runtime session. Feeds the first graph input, reads the first output.
pub struct OnnxNetwork {
    // `Session::run` needs `&mut`; the lock lets handles be shared.
    session: Mutex<Session>,
}

impl OnnxNetwork {
    /// Build a session from graph bytes, serving the external-data file
    /// `weights_name` from `weights`.
    pub fn from_parts(
        graph: &[u8],
        weights_name: &str,
        weights: Vec<u8>,
        intra_threads: usize,
    ) -> Result<Self, ort::Error> {
        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .with_external_initializer_file_in_memory(weights_name, Cow::Owned(weights))?
            .commit_from_memory(graph)?;

        tracing::info!(
            weights = weights_name,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ONNX session"
        );

        Ok(Self {
            session: Mutex::new(session),
        })
    }
}

impl Network for OnnxNetwork {
    fn forward(&self, input: &Tensor) -> Result<Vec<f32>, ModelError> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| ModelError::Inference("session lock poisoned".into()))?;

        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::Inference(format!("score extraction: {e}")))?;

        let scores = data.to_vec();
        Ok(scores)
    }
}

/// Paths of the two files making up one classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifacts {
    pub topology: PathBuf,
    pub weights: PathBuf,
}

impl ModelArtifacts {
    pub fn new(topology: impl Into<PathBuf>, weights: impl Into<PathBuf>) -> Self {
        Self {
            topology: topology.into(),
            weights: weights.into(),
        }
    }

    /// Short model name, taken from the topology file stem.
    pub fn name(&self) -> String {
        self.topology
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.topology.display().to_string())
    }

    /// Read both files, checking that the weights are non-empty and that the
    /// graph names the weights file as its external data.
    fn read(&self) -> Result<ArtifactBytes, LoadError> {
        for path in [&self.topology, &self.weights] {
            if !path.is_file() {
                return Err(LoadError::NotFound(path.display().to_string()));
            }
        }

        let graph = std::fs::read(&self.topology).map_err(|e| LoadError::MalformedTopology {
            path: self.topology.display().to_string(),
            reason: e.to_string(),
        })?;
        let weights = std::fs::read(&self.weights).map_err(|e| incompatible(&self.weights, e.to_string()))?;
        if weights.is_empty() {
            return Err(incompatible(&self.weights, "weights file is empty"));
        }

        let weights_name = self
            .weights
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !references_external_data(&graph, &weights_name) {
            return Err(incompatible(
                &self.weights,
                format!("graph does not reference external data file {weights_name:?}"),
            ));
        }

        Ok(ArtifactBytes {
            graph,
            weights_name,
            weights,
        })
    }
}

struct ArtifactBytes {
    graph: Vec<u8>,
    weights_name: String,
    weights: Vec<u8>,
}

/// Whether the serialized graph carries `name` as an external-data location.
///
/// Locations are stored as plain protobuf strings, so a byte search suffices.
fn references_external_data(graph: &[u8], name: &str) -> bool {
    let name = name.as_bytes();
    !name.is_empty() && graph.windows(name.len()).any(|window| window == name)
}

fn incompatible(path: &Path, reason: impl Into<String>) -> LoadError {
    LoadError::IncompatibleWeights {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

/// Attribute a session build failure to the weights or the graph.
fn classify_commit_error(artifacts: &ModelArtifacts, message: String) -> LoadError {
    let lower = message.to_lowercase();
    if lower.contains("external") || lower.contains("initializer") {
        incompatible(&artifacts.weights, message)
    } else {
        LoadError::MalformedTopology {
            path: artifacts.topology.display().to_string(),
            reason: message,
        }
    }
}

/// A loaded, probed classifier network. Cheap to clone and share.
#[derive(Clone)]
pub struct ModelHandle {
    name: String,
    class_count: usize,
    network: Arc<dyn Network>,
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("name", &self.name)
            .field("class_count", &self.class_count)
            .finish_non_exhaustive()
    }
}

impl ModelHandle {
    /// Load artifacts into an ONNX session and probe it.
    ///
    /// Session build failures mentioning external data or initializers are
    /// attributed to the weights, all others to the topology.
    pub fn load(
        artifacts: &ModelArtifacts,
        class_count: usize,
        intra_threads: usize,
    ) -> Result<Self, LoadError> {
        let bytes = artifacts.read()?;

        let network = OnnxNetwork::from_parts(&bytes.graph, &bytes.weights_name, bytes.weights, intra_threads)
            .map_err(|e| classify_commit_error(artifacts, e.to_string()))?;

        Self::from_network(artifacts.name(), class_count, Arc::new(network)).map_err(|e| match e {
            LoadError::IncompatibleWeights { reason, .. } => incompatible(&artifacts.weights, reason),
            other => other,
        })
    }

    /// Wrap an already-built network, probing it with a zero tensor.
    pub fn from_network(
        name: impl Into<String>,
        class_count: usize,
        network: Arc<dyn Network>,
    ) -> Result<Self, LoadError> {
        let name = name.into();
        let probe = Tensor::zeros(INPUT_CHANNELS, INPUT_SIZE, INPUT_SIZE);
        let scores = network.forward(&probe).map_err(|e| LoadError::IncompatibleWeights {
            path: name.clone(),
            reason: format!("probe pass failed: {e}"),
        })?;

        if scores.len() != class_count {
            return Err(LoadError::ShapeMismatch {
                expected: class_count,
                actual: scores.len(),
            });
        }

        tracing::info!(model = %name, classes = class_count, "model ready");

        Ok(Self {
            name,
            class_count,
            network,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class_count(&self) -> usize {
        self.class_count
    }

    pub fn forward(&self, input: &Tensor) -> Result<Vec<f32>, ModelError> {
        self.network.forward(input)
    }
}

/// Observable state of a [`ModelSlot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SlotStatus {
    Empty,
    Ready,
    Failed { reason: String },
}

enum SlotState<T> {
    Empty,
    Ready(T),
    Failed(String),
}

/// Shared holder for a loaded model that can be replaced at runtime.
///
/// A failed load leaves the slot unusable until a later load succeeds.
pub struct ModelSlot<T> {
    name: String,
    state: RwLock<SlotState<T>>,
}

impl<T: Clone> ModelSlot<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(SlotState::Empty),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the slot content with the result of `load`.
    pub fn load_with<E, F>(&self, load: F) -> Result<(), E>
    where
        E: fmt::Display,
        F: FnOnce() -> Result<T, E>,
    {
        let result = load();
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        match result {
            Ok(value) => {
                *state = SlotState::Ready(value);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(slot = %self.name, error = %e, "model load failed, slot unusable");
                *state = SlotState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// The loaded value, or `Unavailable` if the slot is empty or failed.
    pub fn get(&self) -> Result<T, ModelError> {
        match &*self.state.read().unwrap_or_else(|e| e.into_inner()) {
            SlotState::Ready(value) => Ok(value.clone()),
            SlotState::Empty | SlotState::Failed(_) => Err(ModelError::Unavailable(self.name.clone())),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(
            *self.state.read().unwrap_or_else(|e| e.into_inner()),
            SlotState::Ready(_)
        )
    }

    pub fn status(&self) -> SlotStatus {
        match &*self.state.read().unwrap_or_else(|e| e.into_inner()) {
            SlotState::Empty => SlotStatus::Empty,
            SlotState::Ready(_) => SlotStatus::Ready,
            SlotState::Failed(reason) => SlotStatus::Failed {
                reason: reason.clone(),
            },
        }
    }

    /// Drop any loaded value and return to the empty state.
    pub fn clear(&self) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = SlotState::Empty;
    }
}
