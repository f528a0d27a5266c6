use std::path::{Path, PathBuf};
use std::time::Duration;

use likeness_core::matcher::{MatcherConfig, DEFAULT_DISTANCE_NORMALIZATION, DEFAULT_SIMILARITY_THRESHOLD};
use serde::Deserialize;
use thiserror::Error;

use crate::pipeline::PipelineConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Daemon configuration.
///
/// Layers, lowest first: built-in defaults, the TOML file named by
/// `LIKENESS_CONFIG` (if set), then `LIKENESS_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Minimum similarity for a gallery match.
    pub similarity_threshold: f32,
    /// Distance at which similarity bottoms out at zero.
    pub distance_normalization: f32,
    /// Jobs allowed to execute at once.
    pub max_concurrent_jobs: usize,
    /// Upper bound on one extraction call.
    pub extract_timeout_secs: u64,
    /// Attempts per storage write before a conflict fails the job.
    pub write_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("likeness");

        Self {
            model_dir: likeness_core::default_model_dir(),
            db_path: data_dir.join("faces.db"),
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            distance_normalization: DEFAULT_DISTANCE_NORMALIZATION,
            max_concurrent_jobs: 4,
            extract_timeout_secs: 30,
            write_retries: 3,
        }
    }
}

impl Config {
    /// Load from the optional config file and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("LIKENESS_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let src = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&src)?)
    }

    /// Apply `LIKENESS_*` overrides. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = var("LIKENESS_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(path) = var("LIKENESS_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        override_parsed(&var, "LIKENESS_SIMILARITY_THRESHOLD", &mut self.similarity_threshold);
        override_parsed(&var, "LIKENESS_DISTANCE_NORMALIZATION", &mut self.distance_normalization);
        override_parsed(&var, "LIKENESS_MAX_CONCURRENT_JOBS", &mut self.max_concurrent_jobs);
        override_parsed(&var, "LIKENESS_EXTRACT_TIMEOUT_SECS", &mut self.extract_timeout_secs);
        override_parsed(&var, "LIKENESS_WRITE_RETRIES", &mut self.write_retries);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::Invalid(format!(
                "similarity_threshold must be within [0, 1], got {}",
                self.similarity_threshold
            )));
        }
        if !(self.distance_normalization > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "distance_normalization must be positive, got {}",
                self.distance_normalization
            )));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid("max_concurrent_jobs must be at least 1".into()));
        }
        if self.extract_timeout_secs == 0 {
            return Err(ConfigError::Invalid("extract_timeout_secs must be at least 1".into()));
        }
        if self.write_retries == 0 {
            return Err(ConfigError::Invalid("write_retries must be at least 1".into()));
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            matcher: MatcherConfig {
                distance_normalization: self.distance_normalization,
                similarity_threshold: self.similarity_threshold,
            },
            max_concurrent_jobs: self.max_concurrent_jobs,
            extract_timeout: Duration::from_secs(self.extract_timeout_secs),
            write_retries: self.write_retries,
        }
    }
}

fn override_parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(raw) = var(key) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable override"),
        }
    }
}
