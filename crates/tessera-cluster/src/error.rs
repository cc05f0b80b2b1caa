//! Error types for local clusters.

use std::path::PathBuf;

use tessera_directory::DirectoryError;
use tessera_reactor::ReactorError;
use tessera_region::Region;
use tessera_store::StoreError;
use tessera_types::PeerId;
use thiserror::Error;

/// Cluster management errors.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Cluster not initialized.
    #[error("cluster not initialized at {0}")]
    NotInitialized(PathBuf),

    /// Invalid peer count.
    #[error("invalid peer count: {0} (must be >= 1)")]
    InvalidPeerCount(usize),

    /// Peer not part of the cluster.
    #[error("{0} not found")]
    PeerNotFound(PeerId),

    /// Peer already running.
    #[error("{0} is already running")]
    PeerAlreadyRunning(PeerId),

    /// No single peer currently serves the whole region as primary.
    #[error("no primary serves {region}")]
    NoPrimary { region: Region },

    /// The primary went away before answering.
    #[error("primary {peer} stopped before answering")]
    PrimaryLost { peer: PeerId },

    #[error(transparent)]
    Reactor(#[from] ReactorError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Layered configuration could not be built or is invalid.
    #[error(transparent)]
    Config(#[from] anyhow::Error),

    /// TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, Error>;
