use crate::artifacts::{ArtifactError, ArtifactStore};
use crate::config::Config;
use agelens_core::classifier::ClassLabel;
use agelens_core::detector::{FaceLocator, LocatorError};
use agelens_core::model::{LoadError, ModelError, ModelHandle, ModelSlot, SlotStatus};
use agelens_core::pipeline::{self, Analysis, PipelineError, RequestSequencer, Ticket};
use agelens_core::preprocess::PreprocessConfig;
use agelens_core::{AgeBracket, FaceRegion, Gender, Image};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),
    #[error("locator error: {0}")]
    Locator(#[from] LocatorError),
    #[error("model load error: {0}")]
    Load(#[from] LoadError),
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("gender classification is disabled (set AGELENS_GENDER_ENABLED=1)")]
    GenderDisabled,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Produces the engine's models. Runs on the engine thread.
pub trait ModelLoader: Send + 'static {
    fn locator(&self) -> Result<FaceLocator, EngineError>;
    fn age_model(&self) -> Result<ModelHandle, EngineError>;
    fn gender_model(&self) -> Result<ModelHandle, EngineError>;
}

/// Stages artifacts from the bundle on every load, then loads the local copies.
pub struct BundleLoader {
    config: Config,
    store: ArtifactStore,
}

impl BundleLoader {
    pub fn new(config: Config) -> Self {
        let store = ArtifactStore::new(&config.bundle_dir, &config.model_dir);
        Self { config, store }
    }
}

impl ModelLoader for BundleLoader {
    fn locator(&self) -> Result<FaceLocator, EngineError> {
        let path = self.store.stage(&self.config.artifacts.cascade)?;
        Ok(FaceLocator::load(&path, self.config.locator)?)
    }

    fn age_model(&self) -> Result<ModelHandle, EngineError> {
        let names = &self.config.artifacts;
        self.store.stage_all(&[names.age_topology.as_str(), names.age_weights.as_str()])?;
        Ok(ModelHandle::load(
            &self.config.age_artifacts(),
            AgeBracket::COUNT,
            self.config.intra_threads,
        )?)
    }

    fn gender_model(&self) -> Result<ModelHandle, EngineError> {
        let names = &self.config.artifacts;
        self.store.stage_all(&[names.gender_topology.as_str(), names.gender_weights.as_str()])?;
        Ok(ModelHandle::load(
            &self.config.gender_artifacts(),
            Gender::COUNT,
            self.config.intra_threads,
        )?)
    }
}

/// Progress of the engine's model loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    Loading,
    Finished,
}

/// Snapshot returned by [`EngineHandle::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub load: LoadState,
    pub locator: SlotStatus,
    pub age: SlotStatus,
    /// `None` when gender classification is disabled.
    pub gender: Option<SlotStatus>,
}

struct Models {
    locator: ModelSlot<FaceLocator>,
    age: ModelSlot<ModelHandle>,
    gender: ModelSlot<ModelHandle>,
}

impl Models {
    fn new() -> Self {
        Self {
            locator: ModelSlot::new("face locator"),
            age: ModelSlot::new("age classifier"),
            gender: ModelSlot::new("gender classifier"),
        }
    }
}

/// Engine behaviour fixed at spawn time.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineOptions {
    pub preprocess: PreprocessConfig,
    pub gender_enabled: bool,
}

/// Messages sent from callers to the engine thread.
enum EngineRequest {
    Detect {
        image: Image,
        reply: oneshot::Sender<Result<Vec<FaceRegion>, EngineError>>,
    },
    Age {
        image: Image,
        region: Option<FaceRegion>,
        ticket: Ticket,
        reply: oneshot::Sender<Result<Analysis<AgeBracket>, EngineError>>,
    },
    Gender {
        image: Image,
        region: Option<FaceRegion>,
        ticket: Ticket,
        reply: oneshot::Sender<Result<Analysis<Gender>, EngineError>>,
    },
    Reload {
        reply: oneshot::Sender<()>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    models: Arc<Models>,
    load_state: watch::Receiver<LoadState>,
    sequencer: RequestSequencer,
    gender_enabled: bool,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Locate face regions in an image.
    pub async fn detect(&self, image: Image) -> Result<Vec<FaceRegion>, EngineError> {
        self.call(|reply| EngineRequest::Detect { image, reply }).await
    }

    /// Estimate the age bracket of the given region, or of the first face found.
    ///
    /// Supersedes any request still in flight.
    pub async fn estimate_age(
        &self,
        image: Image,
        region: Option<FaceRegion>,
    ) -> Result<Analysis<AgeBracket>, EngineError> {
        let ticket = self.sequencer.issue();
        self.call(|reply| EngineRequest::Age {
            image,
            region,
            ticket,
            reply,
        })
        .await
    }

    /// Estimate gender, when enabled. Supersedes any request still in flight.
    pub async fn estimate_gender(
        &self,
        image: Image,
        region: Option<FaceRegion>,
    ) -> Result<Analysis<Gender>, EngineError> {
        if !self.gender_enabled {
            return Err(EngineError::GenderDisabled);
        }
        let ticket = self.sequencer.issue();
        self.call(|reply| EngineRequest::Gender {
            image,
            region,
            ticket,
            reply,
        })
        .await
    }

    /// Re-stage and reload all models. Resolves once loading has finished.
    pub async fn reload(&self) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Reload { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Abandon every request still in flight.
    pub fn cancel(&self) {
        self.sequencer.cancel();
    }

    /// Wait until the engine has finished loading models.
    pub async fn wait_loaded(&self) -> Result<(), EngineError> {
        let mut rx = self.load_state.clone();
        rx.wait_for(|state| *state == LoadState::Finished)
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(())
    }

    /// Current load state and slot health. Never blocks on loading.
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            load: *self.load_state.borrow(),
            locator: self.models.locator.status(),
            age: self.models.age.status(),
            gender: self.gender_enabled.then(|| self.models.gender.status()),
        }
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread loads every model first, then serves requests, so requests
/// sent during startup wait for loading to finish. Load failures leave the
/// affected slot unusable; they do not stop the engine.
pub fn spawn_engine<L: ModelLoader>(loader: L, options: EngineOptions) -> Result<EngineHandle, EngineError> {
    let models = Arc::new(Models::new());
    let (state_tx, state_rx) = watch::channel(LoadState::Loading);
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    let thread_models = Arc::clone(&models);
    std::thread::Builder::new()
        .name("agelens-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            load_models(&loader, &thread_models, options.gender_enabled);
            state_tx.send_replace(LoadState::Finished);

            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Detect { image, reply } => {
                        let result = run_detect(&thread_models, &image);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Age {
                        image,
                        region,
                        ticket,
                        reply,
                    } => {
                        let result = run_analysis(
                            &thread_models.locator,
                            &thread_models.age,
                            &options.preprocess,
                            &image,
                            region,
                            &ticket,
                        );
                        let _ = reply.send(result);
                    }
                    EngineRequest::Gender {
                        image,
                        region,
                        ticket,
                        reply,
                    } => {
                        let result = run_analysis(
                            &thread_models.locator,
                            &thread_models.gender,
                            &options.preprocess,
                            &image,
                            region,
                            &ticket,
                        );
                        let _ = reply.send(result);
                    }
                    EngineRequest::Reload { reply } => {
                        state_tx.send_replace(LoadState::Loading);
                        load_models(&loader, &thread_models, options.gender_enabled);
                        state_tx.send_replace(LoadState::Finished);
                        let _ = reply.send(());
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        tx,
        models,
        load_state: state_rx,
        sequencer: RequestSequencer::new(),
        gender_enabled: options.gender_enabled,
    })
}

fn load_models<L: ModelLoader>(loader: &L, models: &Models, gender_enabled: bool) {
    let locator = models.locator.load_with(|| loader.locator());
    let age = models.age.load_with(|| loader.age_model());
    let gender = if gender_enabled {
        models.gender.load_with(|| loader.gender_model()).is_ok()
    } else {
        models.gender.clear();
        false
    };

    tracing::info!(
        locator = locator.is_ok(),
        age = age.is_ok(),
        gender,
        gender_enabled,
        "model loading finished"
    );
}

fn run_detect(models: &Models, image: &Image) -> Result<Vec<FaceRegion>, EngineError> {
    let locator = models.locator.get()?;
    Ok(locator.locate(image))
}

fn run_analysis<L: ClassLabel>(
    locator: &ModelSlot<FaceLocator>,
    model: &ModelSlot<ModelHandle>,
    preprocess: &PreprocessConfig,
    image: &Image,
    region: Option<FaceRegion>,
    ticket: &Ticket,
) -> Result<Analysis<L>, EngineError> {
    let model = model.get()?;
    match region {
        Some(region) => {
            let prediction = pipeline::estimate::<L>(image, &region, &model, preprocess, ticket)?;
            Ok(Analysis::Estimated { region, prediction })
        }
        None => {
            let locator = locator.get()?;
            Ok(pipeline::analyze::<L>(image, &locator, &model, preprocess, ticket)?)
        }
    }
}
