//! Replay construction settings, loaded from JSON.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::memory::DEFAULT_SCRATCH_LIMIT;
use crate::profiling_layers::{ProfilingLayers, RENDER_STAGES_LAYER};
use crate::state::ReplayState;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("required_layer must not be empty")]
    EmptyLayerName,

    #[error("scratch_limit_bytes must be non-zero")]
    ZeroScratchLimit,
}

/// Options handed to the tracing backend untouched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TraceOptions {
    /// Serial of the replay device to trace on; `None` means the device replay runs on.
    pub device: Option<String>,
    /// Stop tracing after this long even if the stream has not ended.
    pub duration_ms: Option<u64>,
    pub buffer_size_kb: u32,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            device: None,
            duration_ms: None,
            buffer_size_kb: 32 * 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplayConfig {
    /// Layer that must be enabled on every replayed instance.
    pub required_layer: String,
    /// Budget for scratch memory used while rewriting commands.
    pub scratch_limit_bytes: u64,
    pub trace: TraceOptions,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            required_layer: RENDER_STAGES_LAYER.to_string(),
            scratch_limit_bytes: DEFAULT_SCRATCH_LIMIT,
            trace: TraceOptions::default(),
        }
    }
}

impl ReplayConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.required_layer.is_empty() {
            return Err(ConfigError::EmptyLayerName);
        }
        if self.scratch_limit_bytes == 0 {
            return Err(ConfigError::ZeroScratchLimit);
        }
        Ok(())
    }

    pub fn profiling_layers(&self) -> ProfilingLayers {
        ProfilingLayers::new(self.required_layer.clone())
    }

    /// Fresh replay state sized by this config.
    pub fn new_state(&self) -> ReplayState {
        ReplayState::new(self.scratch_limit_bytes)
    }
}
