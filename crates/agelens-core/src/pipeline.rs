//! End-to-end analysis: locate, select, preprocess, classify.
//!
//! Every request carries a [`Ticket`]. Issuing a newer ticket (or calling
//! [`RequestSequencer::cancel`]) supersedes older ones, and the pipeline
//! stops with [`PipelineError::Cancelled`] at its next checkpoint instead of
//! running a forward pass whose result nobody wants.

use crate::classifier::{predict, ClassLabel, Prediction};
use crate::detector::{select_canonical, FaceLocator};
use crate::model::{ModelError, ModelHandle};
use crate::preprocess::{preprocess, PreprocessConfig};
use crate::types::{FaceRegion, Image, InvalidRegion};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("request superseded by a newer one")]
    Cancelled,
    #[error(transparent)]
    InvalidRegion(#[from] InvalidRegion),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Hands out monotonically increasing request tickets.
#[derive(Debug, Clone, Default)]
pub struct RequestSequencer {
    latest: Arc<AtomicU64>,
}

impl RequestSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a request, superseding every earlier ticket.
    pub fn issue(&self) -> Ticket {
        let generation = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
        Ticket {
            generation,
            latest: Arc::clone(&self.latest),
        }
    }

    /// Supersede all outstanding tickets.
    pub fn cancel(&self) {
        self.latest.fetch_add(1, Ordering::SeqCst);
    }
}

/// Proof that a request is still the most recent one.
#[derive(Debug, Clone)]
pub struct Ticket {
    generation: u64,
    latest: Arc<AtomicU64>,
}

impl Ticket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self) -> bool {
        self.latest.load(Ordering::SeqCst) == self.generation
    }

    fn checkpoint(&self, stage: &'static str) -> Result<(), PipelineError> {
        if self.is_current() {
            Ok(())
        } else {
            tracing::debug!(generation = self.generation, stage, "request superseded");
            Err(PipelineError::Cancelled)
        }
    }
}

/// Result of one analysis request. `NoFace` is a normal outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Analysis<L> {
    NoFace,
    Estimated {
        region: FaceRegion,
        #[serde(flatten)]
        prediction: Prediction<L>,
    },
}

impl<L: Copy> Analysis<L> {
    pub fn label(&self) -> Option<L> {
        match self {
            Analysis::NoFace => None,
            Analysis::Estimated { prediction, .. } => Some(prediction.label),
        }
    }

    pub fn region(&self) -> Option<FaceRegion> {
        match self {
            Analysis::NoFace => None,
            Analysis::Estimated { region, .. } => Some(*region),
        }
    }
}

/// Classify a known region. The ticket is checked before each stage.
pub fn estimate<L: ClassLabel>(
    image: &Image,
    region: &FaceRegion,
    model: &ModelHandle,
    preprocess_config: &PreprocessConfig,
    ticket: &Ticket,
) -> Result<Prediction<L>, PipelineError> {
    ticket.checkpoint("preprocess")?;
    let tensor = preprocess(image, region, preprocess_config)?;

    ticket.checkpoint("classify")?;
    let prediction = predict::<L>(model, &tensor)?;

    ticket.checkpoint("publish")?;
    Ok(prediction)
}

/// Locate faces, keep the canonical one, and classify it.
///
/// With no face the model is never invoked.
pub fn analyze<L: ClassLabel>(
    image: &Image,
    locator: &FaceLocator,
    model: &ModelHandle,
    preprocess_config: &PreprocessConfig,
    ticket: &Ticket,
) -> Result<Analysis<L>, PipelineError> {
    ticket.checkpoint("locate")?;
    let regions = locator.locate(image);

    let Some(region) = select_canonical(&regions) else {
        tracing::info!(width = image.width(), height = image.height(), "no face found");
        return Ok(Analysis::NoFace);
    };

    let prediction = estimate::<L>(image, &region, model, preprocess_config, ticket)?;
    tracing::info!(
        region = %region,
        candidates = regions.len(),
        label = %prediction.label,
        "estimated"
    );

    Ok(Analysis::Estimated { region, prediction })
}
