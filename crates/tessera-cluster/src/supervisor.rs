//! Supervisor for an in-process cluster of peers.

use std::collections::BTreeMap;
use std::sync::Arc;

use tessera_directory::{Blueprint, BlueprintWatcher, Directory, ManagerState, ShardActivity};
use tessera_reactor::Reactor;
use tessera_region::{Region, Shardable};
use tessera_store::{MemoryStore, ReadQuery, ReadResponse, WriteQuery};
use tessera_types::{Namespace, PeerId, Version};
use tessera_wire::{BroadcastMessage, Endpoint};
use tokio::sync::oneshot;

use crate::{ClusterConfig, Error, LocalPeer, PeerStatus, Result};

/// Peers sharing one directory and one blueprint source.
pub struct LocalCluster {
    config: ClusterConfig,
    namespace: Namespace,
    directory: Directory,
    blueprints: BlueprintWatcher,
    peers: BTreeMap<PeerId, LocalPeer>,
}

impl LocalCluster {
    /// Creates a cluster with every peer stopped.
    pub fn new(config: ClusterConfig) -> Self {
        let peers = config
            .peers
            .iter()
            .map(|&id| (id, LocalPeer::new(id)))
            .collect();

        Self {
            namespace: Namespace::from(config.tessera.reactor.namespace.as_str()),
            config,
            directory: Directory::new(),
            blueprints: BlueprintWatcher::new(),
            peers,
        }
    }

    /// Starts every stopped peer.
    ///
    /// Stops at the first peer that fails to start; peers already started
    /// keep running.
    pub fn start_all(&mut self) -> Result<()> {
        for peer in self.peers.values_mut() {
            if peer.status() == PeerStatus::Running {
                continue;
            }
            peer.start(&self.directory, &self.blueprints, &self.config.tessera)?;
            tracing::info!(peer = %peer.id(), "peer started");
        }
        Ok(())
    }

    /// Starts one peer, with whatever data its store still holds.
    pub fn start_peer(&mut self, id: PeerId) -> Result<()> {
        let peer = self.peers.get_mut(&id).ok_or(Error::PeerNotFound(id))?;
        peer.start(&self.directory, &self.blueprints, &self.config.tessera)?;
        tracing::info!(peer = %id, "peer started");
        Ok(())
    }

    /// Stops every running peer, continuing past failures.
    ///
    /// Returns the first failure, if any.
    pub async fn stop_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for (id, peer) in &mut self.peers {
            match peer.stop(&self.directory).await {
                Ok(()) => tracing::info!(peer = %id, "peer stopped"),
                Err(e) => {
                    tracing::error!(peer = %id, error = %e, "failed to stop peer");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Stops one peer and withdraws it from the directory.
    pub async fn stop_peer(&mut self, id: PeerId) -> Result<()> {
        let peer = self.peers.get_mut(&id).ok_or(Error::PeerNotFound(id))?;
        peer.stop(&self.directory).await?;
        tracing::info!(peer = %id, "peer stopped");
        Ok(())
    }

    /// Returns the status of all peers, ordered by id.
    pub fn status(&self) -> Vec<(PeerId, PeerStatus)> {
        self.peers
            .iter()
            .map(|(id, peer)| (*id, peer.status()))
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.peers
            .values()
            .filter(|peer| peer.status() == PeerStatus::Running)
            .count()
    }

    /// Publishes a new blueprint to every peer.
    pub fn set_blueprint(&self, blueprint: Blueprint) -> Result<()> {
        self.blueprints.set(&self.namespace, blueprint)?;
        Ok(())
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Every present peer's published state.
    pub fn states(&self) -> BTreeMap<PeerId, ManagerState> {
        self.directory.snapshot(&self.namespace)
    }

    pub fn store(&self, id: PeerId) -> Result<&Arc<MemoryStore>> {
        Ok(self.peer(id)?.store())
    }

    /// The peer's reactor, if it is running.
    pub fn reactor(&self, id: PeerId) -> Result<Option<&Reactor>> {
        Ok(self.peer(id)?.reactor())
    }

    /// The peer advertising `Primary` over all of `region`, with its
    /// broadcast endpoint.
    pub fn primary_for(&self, region: &Region) -> Option<(PeerId, Endpoint<BroadcastMessage>)> {
        self.states().into_iter().find_map(|(peer, state)| {
            let serving = state.mask(region);
            if serving.domain() != *region {
                return None;
            }
            match serving.uniform_value()? {
                ShardActivity::Primary {
                    broadcast_endpoint, ..
                } => Some((peer, broadcast_endpoint.clone())),
                _ => None,
            }
        })
    }

    /// Sends a write to the primary serving its keys.
    pub async fn write(&self, query: WriteQuery) -> Result<Version> {
        let (peer, endpoint) = self.route(query.region())?;
        let (resp, reply) = oneshot::channel();
        endpoint
            .send(BroadcastMessage::Write { query, resp })
            .await
            .map_err(|_| Error::PrimaryLost { peer })?;
        let version = reply.await.map_err(|_| Error::PrimaryLost { peer })??;
        Ok(version)
    }

    /// Reads from the primary serving the query's keys.
    pub async fn read(&self, query: ReadQuery) -> Result<ReadResponse> {
        let (peer, endpoint) = self.route(query.region())?;
        let (resp, reply) = oneshot::channel();
        endpoint
            .send(BroadcastMessage::Read { query, resp })
            .await
            .map_err(|_| Error::PrimaryLost { peer })?;
        let response = reply.await.map_err(|_| Error::PrimaryLost { peer })??;
        Ok(response)
    }

    fn route(&self, region: Region) -> Result<(PeerId, Endpoint<BroadcastMessage>)> {
        self.primary_for(&region).ok_or(Error::NoPrimary { region })
    }

    fn peer(&self, id: PeerId) -> Result<&LocalPeer> {
        self.peers.get(&id).ok_or(Error::PeerNotFound(id))
    }
}
