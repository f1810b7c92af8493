use agelens_core::{FaceRegion, Image};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod artifacts;
mod config;
mod engine;

use artifacts::ArtifactStore;
use config::Config;
use engine::{BundleLoader, EngineHandle, EngineOptions};

#[derive(Parser)]
#[command(name = "agelens", about = "Locate a face and estimate its age bracket")]
struct Cli {
    /// Config file (overrides AGELENS_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List face regions found in an image
    Detect {
        /// Image file (PNG, JPEG, ...)
        image: PathBuf,
    },
    /// Estimate the age bracket of the first face, or of a given region
    Estimate {
        image: PathBuf,
        /// Face region as x,y,width,height (skips face location)
        #[arg(long)]
        region: Option<FaceRegion>,
    },
    /// Estimate gender (requires gender_enabled)
    Gender {
        image: PathBuf,
        #[arg(long)]
        region: Option<FaceRegion>,
    },
    /// Copy artifacts from the bundle into the local model directory
    Stage,
    /// Load all models and report their state
    Status {
        /// Re-stage and reload once more before reporting
        #[arg(long)]
        reload: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let mut config = Config::from_file(path)?;
            config.apply_env(|key| std::env::var(key).ok());
            config
        }
        None => Config::load()?,
    };

    match cli.command {
        Commands::Stage => {
            let store = ArtifactStore::new(&config.bundle_dir, &config.model_dir);
            let staged = store.stage_all(&config.artifacts.required(config.gender_enabled))?;
            print_json(&staged)?;
        }
        Commands::Status { reload } => {
            let engine = start_engine(&config)?;
            engine.wait_loaded().await?;
            if reload {
                engine.reload().await?;
            }
            print_json(&engine.status())?;
        }
        Commands::Detect { image } => {
            let image = read_image(&image)?;
            let engine = start_engine(&config)?;
            let faces = engine.detect(image).await?;
            print_json(&serde_json::json!({ "faces": faces }))?;
        }
        Commands::Estimate { image, region } => {
            let image = read_image(&image)?;
            let engine = start_engine(&config)?;
            cancel_on_interrupt(&engine);
            print_json(&engine.estimate_age(image, region).await?)?;
        }
        Commands::Gender { image, region } => {
            let image = read_image(&image)?;
            let engine = start_engine(&config)?;
            cancel_on_interrupt(&engine);
            print_json(&engine.estimate_gender(image, region).await?)?;
        }
    }

    Ok(())
}

fn start_engine(config: &Config) -> Result<EngineHandle> {
    agelens_core::initialize_runtime();
    let options = EngineOptions {
        preprocess: config.preprocess,
        gender_enabled: config.gender_enabled,
    };
    Ok(engine::spawn_engine(BundleLoader::new(config.clone()), options)?)
}

/// Ctrl-C cancels the request in flight.
fn cancel_on_interrupt(engine: &EngineHandle) {
    let engine = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, cancelling request");
            engine.cancel();
        }
    });
}

fn read_image(path: &Path) -> Result<Image> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let image = Image::decode(&bytes).with_context(|| format!("decoding {}", path.display()))?;
    tracing::debug!(
        path = %path.display(),
        width = image.width(),
        height = image.height(),
        "image loaded"
    );
    Ok(image)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
