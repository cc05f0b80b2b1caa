//! tessera-directory: Presence and placement for `Tessera`
//!
//! Peers coordinate through two observables:
//!
//! - The **blueprint**: the externally computed target assignment of a
//!   primary and secondaries to every region. Peers only watch it.
//! - The **directory**: every peer's self-reported [`ManagerState`], the
//!   activity it is actually running per region. Each peer publishes its own
//!   state and watches everyone else's.
//!
//! A peer that leaves (or is lost) is disconnected from the directory, which
//! turns every state it published into `None`. Watchers use that as the
//! liveness signal.
//!
//! # Example
//!
//! ```
//! use std::collections::BTreeSet;
//!
//! use tessera_directory::{Blueprint, BlueprintWatcher, ShardAssignment};
//! use tessera_region::Region;
//! use tessera_types::{Namespace, PeerId};
//!
//! let ns = Namespace::from("default");
//! let watcher = BlueprintWatcher::new();
//! let blueprint = Blueprint::new(
//!     Region::universe(),
//!     ShardAssignment::new(PeerId::new(1), BTreeSet::from([PeerId::new(2)])),
//! );
//!
//! watcher.set(&ns, blueprint.clone()).unwrap();
//! assert_eq!(*watcher.watch_blueprint(&ns).borrow(), blueprint);
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tessera_region::{Region, RegionMap};
use tessera_types::{BranchId, Namespace, PeerId, VersionRange};
use tessera_wire::{BackfillerMessage, BroadcastMessage, Endpoint};
use tokio::sync::watch;

// ============================================================================
// Shard Activities
// ============================================================================

/// What a peer is doing for one region, as advertised to other peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardActivity {
    /// No data, no services.
    Inactive,
    /// Holds data at `version` and can act as a backfill source, but serves
    /// no live queries.
    Cold {
        version: VersionRange,
        backfill_endpoint: Endpoint<BackfillerMessage>,
    },
    /// Serves live reads and writes and can backfill others.
    Primary {
        branch_id: BranchId,
        broadcast_endpoint: Endpoint<BroadcastMessage>,
        backfill_endpoint: Endpoint<BackfillerMessage>,
    },
    /// Tracks a primary's write stream and can backfill others.
    Secondary {
        branch_id: BranchId,
        backfill_endpoint: Endpoint<BackfillerMessage>,
    },
}

impl ShardActivity {
    /// The backfill source endpoint, if this activity holds data.
    pub fn backfill_endpoint(&self) -> Option<&Endpoint<BackfillerMessage>> {
        match self {
            ShardActivity::Inactive => None,
            ShardActivity::Cold {
                backfill_endpoint, ..
            }
            | ShardActivity::Primary {
                backfill_endpoint, ..
            }
            | ShardActivity::Secondary {
                backfill_endpoint, ..
            } => Some(backfill_endpoint),
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, ShardActivity::Primary { .. })
    }

    pub fn is_secondary(&self) -> bool {
        matches!(self, ShardActivity::Secondary { .. })
    }

    pub fn is_inactive(&self) -> bool {
        matches!(self, ShardActivity::Inactive)
    }
}

/// A peer's self-reported activity across the whole keyspace.
pub type ManagerState = RegionMap<ShardActivity>;

// ============================================================================
// Blueprint
// ============================================================================

/// The peers assigned to one region.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardAssignment {
    pub primary: PeerId,
    pub secondaries: BTreeSet<PeerId>,
}

impl ShardAssignment {
    pub fn new(primary: PeerId, secondaries: BTreeSet<PeerId>) -> Self {
        Self {
            primary,
            secondaries,
        }
    }

    /// An assignment with a primary and no secondaries.
    pub fn primary_only(primary: PeerId) -> Self {
        Self::new(primary, BTreeSet::new())
    }

    /// Every peer named by this assignment.
    pub fn peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        std::iter::once(self.primary).chain(self.secondaries.iter().copied())
    }
}

/// The target assignment for every region.
///
/// A usable blueprint covers [`Region::universe()`]; see [`validate_blueprint`].
pub type Blueprint = RegionMap<ShardAssignment>;

/// Checks that `blueprint` covers the whole keyspace.
pub fn validate_blueprint(blueprint: &Blueprint) -> Result<(), DirectoryError> {
    if blueprint.domain() == Region::universe() {
        Ok(())
    } else {
        Err(DirectoryError::PartialBlueprint {
            domain: blueprint.domain(),
        })
    }
}

/// Publishes blueprints, one observable per namespace.
///
/// Namespaces nobody has set yet hold an empty blueprint, which reactors
/// treat as "nothing to do yet".
#[derive(Debug, Clone, Default)]
pub struct BlueprintWatcher {
    inner: Arc<Mutex<HashMap<Namespace, Arc<watch::Sender<Blueprint>>>>>,
}

impl BlueprintWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the blueprint for `namespace` and notifies every watcher.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::PartialBlueprint`] if the blueprint does not
    /// cover the universe.
    pub fn set(&self, namespace: &Namespace, blueprint: Blueprint) -> Result<(), DirectoryError> {
        validate_blueprint(&blueprint)?;
        tracing::debug!(namespace = %namespace, entries = blueprint.len(), "blueprint updated");
        self.sender(namespace).send_replace(blueprint);
        Ok(())
    }

    /// Observes the blueprint for `namespace`.
    pub fn watch_blueprint(&self, namespace: &Namespace) -> watch::Receiver<Blueprint> {
        self.sender(namespace).subscribe()
    }

    /// Returns the current blueprint for `namespace`.
    pub fn current(&self, namespace: &Namespace) -> Blueprint {
        self.sender(namespace).borrow().clone()
    }

    fn sender(&self, namespace: &Namespace) -> Arc<watch::Sender<Blueprint>> {
        let mut senders = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            senders
                .entry(namespace.clone())
                .or_insert_with(|| Arc::new(watch::channel(Blueprint::default()).0)),
        )
    }
}

// ============================================================================
// Directory
// ============================================================================

/// In-process presence service shared by every peer of a cluster.
///
/// Cloning is cheap; all clones observe the same state.
#[derive(Debug, Clone)]
pub struct Directory {
    inner: Arc<Mutex<DirectoryInner>>,
    changes: Arc<watch::Sender<u64>>,
}

#[derive(Debug, Default)]
struct DirectoryInner {
    states: HashMap<(PeerId, Namespace), watch::Sender<Option<ManagerState>>>,
}

impl Directory {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(DirectoryInner::default())),
            changes: Arc::new(watch::channel(0).0),
        }
    }

    /// Publishes `state` as `peer`'s current activity in `namespace`.
    pub fn publish(&self, peer: PeerId, namespace: &Namespace, state: ManagerState) {
        {
            let mut inner = self.lock();
            inner
                .states
                .entry((peer, namespace.clone()))
                .or_insert_with(|| watch::channel(None).0)
                .send_replace(Some(state));
        }
        self.bump();
    }

    /// Observes `peer`'s state in `namespace`; `None` while the peer is absent.
    pub fn watch(&self, peer: PeerId, namespace: &Namespace) -> watch::Receiver<Option<ManagerState>> {
        let mut inner = self.lock();
        inner
            .states
            .entry((peer, namespace.clone()))
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    /// Marks `peer` as gone: every state it published becomes `None`.
    pub fn disconnect(&self, peer: PeerId) {
        let mut cleared = 0usize;
        {
            let inner = self.lock();
            for ((owner, _), sender) in &inner.states {
                if *owner == peer && sender.borrow().is_some() {
                    sender.send_replace(None);
                    cleared += 1;
                }
            }
        }
        tracing::debug!(peer = %peer, namespaces = cleared, "peer disconnected");
        self.bump();
    }

    /// Every present peer's state in `namespace`, ordered by peer id.
    pub fn snapshot(&self, namespace: &Namespace) -> BTreeMap<PeerId, ManagerState> {
        let inner = self.lock();
        inner
            .states
            .iter()
            .filter(|((_, ns), _)| ns == namespace)
            .filter_map(|((peer, _), sender)| sender.borrow().clone().map(|s| (*peer, s)))
            .collect()
    }

    /// A counter bumped on every publish or disconnect.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn bump(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }

    fn lock(&self) -> MutexGuard<'_, DirectoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from blueprint and directory operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// A blueprint must assign every key.
    #[error("blueprint covers {domain}, not the whole keyspace")]
    PartialBlueprint { domain: Region },
}

#[cfg(test)]
mod tests;
