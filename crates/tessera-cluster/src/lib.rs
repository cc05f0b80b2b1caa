//! In-process clusters of Tessera peers.
//!
//! Runs several peers inside one tokio runtime for tests and development:
//! - One [`MemoryStore`](tessera_store::MemoryStore) and one reactor per peer
//! - A shared directory and blueprint source
//! - Writes and reads routed to whichever peer currently serves as primary
//! - Peer stop and restart, with the store kept across restarts

pub mod config;
pub mod error;
pub mod node;
pub mod supervisor;

pub use config::ClusterConfig;
pub use error::{Error, Result};
pub use node::{LocalPeer, PeerStatus};
pub use supervisor::LocalCluster;

use std::path::Path;

use tessera_config::TesseraConfig;

/// Creates a cluster configuration for `peer_count` peers and saves it to
/// `dir`.
pub fn init_cluster(dir: &Path, peer_count: usize, tessera: TesseraConfig) -> Result<ClusterConfig> {
    let config = ClusterConfig::new(peer_count, tessera)?;
    config.save(dir)?;
    Ok(config)
}

/// Loads the cluster saved in `dir`, layers `tessera.toml` and `TSR_*`
/// overrides over it (see [`ClusterConfig::resolve`]) and starts every peer.
pub fn start_cluster(dir: &Path) -> Result<LocalCluster> {
    let config = ClusterConfig::resolve(dir)?;
    let mut cluster = LocalCluster::new(config);
    cluster.start_all()?;
    Ok(cluster)
}

/// Stops a running cluster gracefully.
pub async fn stop_cluster(cluster: &mut LocalCluster) -> Result<()> {
    cluster.stop_all().await
}
