use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {0:?}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("Failed to parse TOML from config file {0:?}: {1}")]
    Parse(PathBuf, toml::de::Error),
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct LopConfig {
    /// Path to the instrumented target binary.
    pub target: PathBuf,
    /// Extra argv passed to the target, after the binary name.
    #[serde(default)]
    pub target_args: Vec<String>,
    /// Initial corpus, read-only.
    pub seeds_folder: PathBuf,
    /// Where admitted seeds are written as `id_<n>`.
    #[serde(default = "default_queue_folder")]
    pub queue_folder: PathBuf,
    /// Where crashing inputs are written.
    #[serde(default = "default_crashes_folder")]
    pub crashes_folder: PathBuf,
    /// The single staged-input file the target reads on stdin.
    #[serde(default = "default_current_input")]
    pub current_input: PathBuf,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Optional AFL-format dictionary file.
    pub dictionary: Option<PathBuf>,
    /// Fixed RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Stop after this many target executions. Unbounded when absent.
    pub max_execs: Option<u64>,
}

pub fn default_queue_folder() -> PathBuf {
    PathBuf::from("queue")
}
pub fn default_crashes_folder() -> PathBuf {
    PathBuf::from("crashes")
}
pub fn default_current_input() -> PathBuf {
    PathBuf::from(".current_input")
}
pub fn default_timeout_ms() -> u64 {
    1000
}

impl LopConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
