//! Runtime configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{DatError, Result};
use crate::ids::DEFAULT_ID_LENGTH;

/// Environment variable prefix read by [`DatConfig::apply_env`].
pub const ENV_PREFIX: &str = "DAT_";

/// Logging output configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    #[serde(default = "default_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

/// Configuration of the DAT pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatConfig {
    /// Hex length of stage ids.
    #[serde(default = "default_id_length")]
    pub id_length: usize,
    /// Files above this size are read in chunks.
    #[serde(default = "default_stream_threshold")]
    pub stream_threshold_bytes: u64,
    /// Hard per-file probe timeout.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    /// Concurrent probe and extraction workers.
    #[serde(default = "default_pool_size")]
    pub worker_pool_size: usize,
    /// Bytes of each file read for context content patterns.
    #[serde(default = "default_context_sample")]
    pub context_sample_bytes: u64,
    /// Rows per chunk when streaming.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Run state directory, relative to the workspace.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_id_length() -> usize {
    DEFAULT_ID_LENGTH
}

fn default_stream_threshold() -> u64 {
    10 * 1024 * 1024 // 10MB
}

fn default_probe_timeout() -> u64 {
    1000
}

fn default_pool_size() -> usize {
    4
}

fn default_context_sample() -> u64 {
    1024 * 1024
}

fn default_chunk_size() -> usize {
    10_000
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".dat")
}

impl Default for DatConfig {
    fn default() -> Self {
        Self {
            id_length: default_id_length(),
            stream_threshold_bytes: default_stream_threshold(),
            probe_timeout_ms: default_probe_timeout(),
            worker_pool_size: default_pool_size(),
            context_sample_bytes: default_context_sample(),
            chunk_size: default_chunk_size(),
            state_dir: default_state_dir(),
            logging: LoggingConfig::default(),
        }
    }
}

impl DatConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a configuration from a JSON file; absent fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or malformed.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| DatError::io(path, e))?;
        serde_json::from_str(&text).map_err(|e| DatError::Config(format!("{}: {e}", path.display())))
    }

    /// Overrides fields from `DAT_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::Config`] if a variable does not parse.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_vars(|name| std::env::var(format!("{ENV_PREFIX}{name}")).ok())
    }

    fn apply_vars<F>(mut self, var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| DatError::Config(format!("{ENV_PREFIX}{name}: cannot parse '{value}'")))
        }

        if let Some(v) = var("ID_LENGTH") {
            self.id_length = parse("ID_LENGTH", &v)?;
        }
        if let Some(v) = var("STREAM_THRESHOLD_BYTES") {
            self.stream_threshold_bytes = parse("STREAM_THRESHOLD_BYTES", &v)?;
        }
        if let Some(v) = var("PROBE_TIMEOUT_MS") {
            self.probe_timeout_ms = parse("PROBE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = var("WORKER_POOL_SIZE") {
            self.worker_pool_size = parse("WORKER_POOL_SIZE", &v)?;
        }
        if let Some(v) = var("CONTEXT_SAMPLE_BYTES") {
            self.context_sample_bytes = parse("CONTEXT_SAMPLE_BYTES", &v)?;
        }
        if let Some(v) = var("CHUNK_SIZE") {
            self.chunk_size = parse("CHUNK_SIZE", &v)?;
        }
        if let Some(v) = var("STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }
        if let Some(v) = var("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = var("LOG_JSON") {
            self.logging.json = parse("LOG_JSON", &v)?;
        }
        Ok(self)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::Config`] for an id length outside 4..=64, a zero
    /// pool or chunk size, or an absolute state directory.
    pub fn validate(&self) -> Result<()> {
        if !(4..=64).contains(&self.id_length) {
            return Err(DatError::Config(format!(
                "id_length must be between 4 and 64, got {}",
                self.id_length
            )));
        }
        if self.worker_pool_size == 0 {
            return Err(DatError::Config("worker_pool_size must be positive".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(DatError::Config("chunk_size must be positive".to_string()));
        }
        if self.state_dir.is_absolute() {
            return Err(DatError::Config("state_dir must be workspace-relative".to_string()));
        }
        Ok(())
    }

    /// Sets the stage id length.
    #[must_use]
    pub fn with_id_length(mut self, id_length: usize) -> Self {
        self.id_length = id_length;
        self
    }

    /// Sets the worker pool size.
    #[must_use]
    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    /// Sets the probe timeout.
    #[must_use]
    pub fn with_probe_timeout_ms(mut self, ms: u64) -> Self {
        self.probe_timeout_ms = ms;
        self
    }

    /// Sets the context sample size.
    #[must_use]
    pub fn with_context_sample_bytes(mut self, bytes: u64) -> Self {
        self.context_sample_bytes = bytes;
        self
    }

    /// Sets the state directory.
    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// Gets the probe timeout as a Duration.
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}
