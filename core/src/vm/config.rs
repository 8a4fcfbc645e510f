use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Engine tuning knobs. Every field has a default, so a config file only
/// needs the ones it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Instructions between cooperative yields in async mode.
    pub yield_interval: usize,
    /// Call depth limit; exceeding it is fatal to the job.
    pub max_frames: usize,
    /// Instruction budget per bounded run.
    pub default_budget: u64,
    /// Fuse instruction runs at load time.
    pub fusion: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            yield_interval: 1024,
            max_frames: 4096,
            default_budget: 10_000,
            fusion: true,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid engine config")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in {}", path.display()))
    }
}
