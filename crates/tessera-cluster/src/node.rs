//! Peer lifecycle.

use std::sync::Arc;

use tessera_config::TesseraConfig;
use tessera_directory::{BlueprintWatcher, Directory};
use tessera_reactor::Reactor;
use tessera_region::Region;
use tessera_store::{MemoryStore, StoreView};
use tessera_types::PeerId;

use crate::{Error, Result};

/// Status of a cluster peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Peer is stopped; its store survives for a restart.
    Stopped,

    /// Peer's reactor is running.
    Running,
}

/// One peer: a store that outlives restarts and, while running, a reactor.
pub struct LocalPeer {
    id: PeerId,
    store: Arc<MemoryStore>,
    reactor: Option<Reactor>,
}

impl LocalPeer {
    /// Creates a stopped peer with an empty store.
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            store: Arc::new(MemoryStore::new(Region::universe())),
            reactor: None,
        }
    }

    /// Starts the peer's reactor on the current runtime.
    pub fn start(
        &mut self,
        directory: &Directory,
        blueprints: &BlueprintWatcher,
        config: &TesseraConfig,
    ) -> Result<()> {
        if self.reactor.is_some() {
            return Err(Error::PeerAlreadyRunning(self.id));
        }

        let reactor = Reactor::start(
            self.id,
            Arc::clone(&self.store) as Arc<dyn StoreView>,
            directory.clone(),
            blueprints.clone(),
            config.clone(),
        )?;
        self.reactor = Some(reactor);
        Ok(())
    }

    /// Drains the reactor, then withdraws the peer from the directory.
    pub async fn stop(&mut self, directory: &Directory) -> Result<()> {
        let Some(reactor) = self.reactor.take() else {
            return Ok(()); // Already stopped
        };

        let outcome = reactor.shutdown().await;
        directory.disconnect(self.id);
        outcome?;
        Ok(())
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn status(&self) -> PeerStatus {
        if self.reactor.is_some() {
            PeerStatus::Running
        } else {
            PeerStatus::Stopped
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn reactor(&self) -> Option<&Reactor> {
        self.reactor.as_ref()
    }
}
