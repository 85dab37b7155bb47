//! CLI configuration: TOML file with command-line overrides

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use bitchat_core::config::{
    DedupConfig, FragmentConfig, MeshConfig, NoiseConfig, PendingFileConfig, PipelineConfig,
};
use bitchat_nostr::RelayConfig;

/// Everything configurable about a node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Display name announced to the mesh
    pub nickname: Option<String>,
    pub mesh: MeshConfig,
    pub fragment: FragmentConfig,
    pub dedup: DedupConfig,
    pub noise: NoiseConfig,
    pub pipeline: PipelineConfig,
    pub pending_files: PendingFileConfig,
    pub relay: RelayConfig,
}

impl NodeConfig {
    /// Load a TOML config, or defaults when the file does not exist
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }
}

/// Default data directory (`~/.local/share/bitchat` or platform equivalent)
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bitchat")
}

// Manual Default impls are not needed: the nested configs all default to
// protocol constants.
