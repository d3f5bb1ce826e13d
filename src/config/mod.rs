//! Engine configuration — sampling knobs, engine selection, data directory.

use crate::error::{EngineError, Result};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Context-window budget reported through `get_token_info`. Advisory only;
/// the engine never enforces a hard cutoff.
pub const DEFAULT_TOKEN_BUDGET: u32 = 32_768;

/// Environment variable selecting the backend when `--provider` is absent.
pub const ENGINE_ENV: &str = "RETRIEVER_ENGINE";

const DEFAULT_ENGINE: &str = "gemini";

/// Optional sampling knobs, uniform across backends. Each provider filters
/// out the knobs its capability set does not cover before building a
/// request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SamplingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

impl SamplingConfig {
    pub fn is_empty(&self) -> bool {
        self.top_p.is_none() && self.top_k.is_none() && self.temperature.is_none()
    }
}

/// Resolved engine configuration, assembled from CLI flags and environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub engine: String,
    /// Backend model name; each provider substitutes its own default when
    /// unset.
    pub model: Option<String>,
    pub sampling: SamplingConfig,
    pub data_dir: PathBuf,
    pub token_budget: u32,
}

impl EngineConfig {
    /// Build a config from already-parsed CLI values. Engine resolution
    /// order: explicit flag, `RETRIEVER_ENGINE`, then the Gemini default.
    pub fn resolve(
        engine_flag: Option<String>,
        model: Option<String>,
        sampling: SamplingConfig,
        data_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let engine = engine_flag
            .or_else(|| std::env::var(ENGINE_ENV).ok().filter(|v| !v.is_empty()))
            .unwrap_or_else(|| DEFAULT_ENGINE.to_string())
            .to_lowercase();

        let data_dir = match data_dir {
            Some(dir) => dir,
            None => default_data_dir()?,
        };

        Ok(Self {
            engine,
            model,
            sampling,
            data_dir,
            token_budget: DEFAULT_TOKEN_BUDGET,
        })
    }
}

/// Per-user application directory where snapshots and WALs live.
pub fn default_data_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("", "", "retriever").ok_or_else(|| {
        EngineError::Config("cannot determine a home directory for session storage".into())
    })?;
    Ok(dirs.data_dir().to_path_buf())
}
