//! Cluster configuration management.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tessera_config::{ConfigLoader, TesseraConfig};
use tessera_types::PeerId;

use crate::{Error, Result};

const CONFIG_FILE: &str = "cluster.toml";

/// Configuration for a local Tessera cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Peers in the cluster, in start order.
    pub peers: Vec<PeerId>,

    /// Configuration every peer's reactor starts with.
    #[serde(default)]
    pub tessera: TesseraConfig,
}

impl ClusterConfig {
    /// Creates a configuration for `peer_count` peers numbered from 1.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPeerCount`] for an empty cluster.
    pub fn new(peer_count: usize, tessera: TesseraConfig) -> Result<Self> {
        if peer_count == 0 {
            return Err(Error::InvalidPeerCount(peer_count));
        }
        let peers = (1..=peer_count as u64).map(PeerId::new).collect();
        Ok(Self { peers, tessera })
    }

    /// Loads cluster configuration from `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = Self::path(dir);
        if !config_path.exists() {
            return Err(Error::NotInitialized(dir.to_path_buf()));
        }

        let content = fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        if config.peers.is_empty() {
            return Err(Error::InvalidPeerCount(0));
        }
        Ok(config)
    }

    /// Loads cluster configuration from `dir` and layers the usual
    /// configuration sources over its `tessera` section: the user config,
    /// `tessera.toml` and `tessera.local.toml` in `dir`, then `TSR_*`
    /// environment variables.
    pub fn resolve(dir: &Path) -> Result<Self> {
        Self::resolve_with(dir, ConfigLoader::new())
    }

    /// Like [`resolve`](Self::resolve), reading whichever sources `loader`
    /// is set up for.
    pub fn resolve_with(dir: &Path, loader: ConfigLoader) -> Result<Self> {
        let mut config = Self::load(dir)?;
        let base = std::mem::take(&mut config.tessera);
        config.tessera = loader.with_base(base).with_project_dir(dir).load()?;
        Ok(config)
    }

    /// Saves cluster configuration to `dir`, creating it if needed.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let content = toml::to_string_pretty(self)?;
        fs::write(Self::path(dir), content)?;
        Ok(())
    }

    pub fn path(dir: &Path) -> PathBuf {
        dir.join(CONFIG_FILE)
    }
}
