use agelens_core::detector::LocatorParams;
use agelens_core::model::ModelArtifacts;
use agelens_core::preprocess::PreprocessConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Runtime configuration: defaults, then the TOML file, then `AGELENS_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Read-only directory the artifacts ship in.
    pub bundle_dir: PathBuf,
    /// Private directory artifacts are staged into and loaded from.
    pub model_dir: PathBuf,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
    /// Load and serve the gender classifier as well.
    pub gender_enabled: bool,
    pub locator: LocatorParams,
    pub preprocess: PreprocessConfig,
    pub artifacts: ArtifactNames,
}

/// File names of the staged artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactNames {
    pub cascade: String,
    pub age_topology: String,
    pub age_weights: String,
    pub gender_topology: String,
    pub gender_weights: String,
}

impl Default for ArtifactNames {
    fn default() -> Self {
        Self {
            cascade: "haarcascade_frontalface_default.xml".into(),
            age_topology: "age_net.onnx".into(),
            age_weights: "age_net.onnx.data".into(),
            gender_topology: "gender_net.onnx".into(),
            gender_weights: "gender_net.onnx.data".into(),
        }
    }
}

impl ArtifactNames {
    /// Every file name that must be staged for the given capabilities.
    pub fn required(&self, gender_enabled: bool) -> Vec<&str> {
        let mut names = vec![
            self.cascade.as_str(),
            self.age_topology.as_str(),
            self.age_weights.as_str(),
        ];
        if gender_enabled {
            names.push(self.gender_topology.as_str());
            names.push(self.gender_weights.as_str());
        }
        names
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bundle_dir: PathBuf::from("/usr/share/agelens"),
            model_dir: data_dir().join("models"),
            intra_threads: 2,
            gender_enabled: false,
            locator: LocatorParams::default(),
            preprocess: PreprocessConfig::default(),
            artifacts: ArtifactNames::default(),
        }
    }
}

impl Config {
    /// Load from `AGELENS_CONFIG` (or the XDG default path) and the environment.
    ///
    /// A missing file is not an error; a malformed one is.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("AGELENS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"));

        let mut config = if path.is_file() {
            let config = Self::from_file(&path)?;
            tracing::debug!(path = %path.display(), "loaded config file");
            config
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Overlay `AGELENS_*` variables. Unparseable values are ignored.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = var("AGELENS_BUNDLE_DIR") {
            self.bundle_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("AGELENS_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        self.locator.scale_factor = env_parse(&var, "AGELENS_SCALE_FACTOR", self.locator.scale_factor);
        self.locator.min_neighbors = env_parse(&var, "AGELENS_MIN_NEIGHBORS", self.locator.min_neighbors);
        self.locator.min_size = env_parse(&var, "AGELENS_MIN_FACE_SIZE", self.locator.min_size);
        self.intra_threads = env_parse(&var, "AGELENS_INTRA_THREADS", self.intra_threads);
        if let Some(v) = var("AGELENS_GENDER_ENABLED") {
            self.gender_enabled = v != "0" && !v.eq_ignore_ascii_case("false");
        }
    }

    pub fn age_artifacts(&self) -> ModelArtifacts {
        ModelArtifacts::new(
            self.model_dir.join(&self.artifacts.age_topology),
            self.model_dir.join(&self.artifacts.age_weights),
        )
    }

    pub fn gender_artifacts(&self) -> ModelArtifacts {
        ModelArtifacts::new(
            self.model_dir.join(&self.artifacts.gender_topology),
            self.model_dir.join(&self.artifacts.gender_weights),
        )
    }
}

fn env_parse<T, F>(var: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
        .join("agelens")
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("agelens")
}
