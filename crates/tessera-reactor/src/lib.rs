//! tessera-reactor: Blueprint-driven reactor for `Tessera`
//!
//! The reactor converges one peer's activity to the blueprint. It partitions
//! the keyspace into maximal sub-regions over which this peer's
//! [`DesiredActivity`] is constant and runs exactly one activity per
//! sub-region:
//!
//! - **nothing**: offers local data as `Cold` until every assigned peer
//!   advertises its role, then erases it and publishes `Inactive`
//! - **primary**: waits for the previous primary to step down, backfills from
//!   the newest `Cold` copies, starts a fresh branch and serves writes,
//!   reads and subscriptions
//! - **secondary**: subscribes to the assigned primary, backfills unless
//!   already caught up, then applies the primary's write stream
//!
//! Each activity has a monitor that cancels it once the blueprint stops
//! asking for it. When an activity exits, for any reason, its region is
//! released and dispatch runs again; after a failure other than a lost peer
//! the release waits out `reactor.retry_backoff_ms` first.
//!
//! # Safety invariant
//!
//! The regions of running activities are pairwise disjoint: dispatch checks
//! and marks regions under one lock, and never spawns over a marked key.

use std::sync::Arc;
use std::time::Duration;

use tessera_backfill::{BackfillError, Backfiller};
use tessera_config::{ConfigError, TesseraConfig};
use tessera_directory::{BlueprintWatcher, Directory, ManagerState};
use tessera_region::{Region, RegionError};
use tessera_store::{StoreError, StoreView};
use tessera_types::{Namespace, PeerId};
use tessera_wire::{BackfillerMessage, Endpoint};
use tokio::runtime::Handle;

mod context;
mod desired;
mod nothing;
mod primary;
mod secondary;

pub use desired::{DesiredActivity, desired_map};

use context::ReactorContext;

// ============================================================================
// Reactor
// ============================================================================

/// One peer's reactor for one namespace.
///
/// Dropping the reactor cancels every activity without waiting; call
/// [`Reactor::shutdown`] to drain them.
pub struct Reactor {
    ctx: Arc<ReactorContext>,
}

impl Reactor {
    /// Starts the reactor on the current tokio runtime.
    ///
    /// Spawns the peer's backfiller, publishes an all-`Inactive` state, and
    /// dispatches against the current blueprint and every later one.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::Config`] for an invalid configuration and
    /// [`ReactorError::NoRuntime`] outside a tokio runtime.
    pub fn start(
        peer: PeerId,
        store: Arc<dyn StoreView>,
        directory: Directory,
        blueprints: BlueprintWatcher,
        config: TesseraConfig,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| ReactorError::NoRuntime)?;

        let (backfill_endpoint, backfill_mailbox) =
            Endpoint::<BackfillerMessage>::channel(peer, config.mailbox.capacity);
        let backfiller =
            Backfiller::new(peer, Arc::clone(&store)).with_chunk_size(config.backfill.chunk_size);

        let ctx = Arc::new(ReactorContext::new(
            peer,
            store,
            directory,
            blueprints,
            backfill_endpoint,
            config,
            runtime,
        ));
        ctx.announce();

        ctx.tracker
            .spawn(backfiller.run(backfill_mailbox, ctx.shutdown.child_token()));
        ctx.tracker.spawn(watch_blueprint(Arc::clone(&ctx)));

        tracing::info!(peer = %peer, namespace = %ctx.namespace, "reactor started");
        Ok(Self { ctx })
    }

    pub fn peer(&self) -> PeerId {
        self.ctx.peer
    }

    pub fn namespace(&self) -> &Namespace {
        &self.ctx.namespace
    }

    /// Where this peer's backfiller listens.
    pub fn backfill_endpoint(&self) -> Endpoint<BackfillerMessage> {
        self.ctx.backfill_endpoint.clone()
    }

    /// Regions with a running activity, sorted.
    pub fn active_regions(&self) -> Vec<Region> {
        self.ctx.active_regions()
    }

    /// The state this peer last published.
    pub fn published(&self) -> ManagerState {
        self.ctx.published()
    }

    /// How many activities have failed with an error other than a lost
    /// peer since the reactor started.
    pub fn failed_activities(&self) -> u64 {
        self.ctx.failures()
    }

    /// Cancels every activity and waits for all of them, and the backfiller,
    /// to finish.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::ShutdownTimeout`] if they do not finish within
    /// the configured timeout.
    pub async fn shutdown(&self) -> Result<()> {
        self.ctx.shutdown.cancel();
        self.ctx.tracker.close();

        let timeout = self.ctx.config.shutdown_timeout();
        if tokio::time::timeout(timeout, self.ctx.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(peer = %self.ctx.peer, pending = self.ctx.tracker.len(), "reactor shutdown timed out");
            return Err(ReactorError::ShutdownTimeout(timeout));
        }
        tracing::info!(peer = %self.ctx.peer, "reactor stopped");
        Ok(())
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.ctx.shutdown.cancel();
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("peer", &self.ctx.peer)
            .field("namespace", &self.ctx.namespace)
            .field("active_regions", &self.ctx.active_regions())
            .finish_non_exhaustive()
    }
}

/// Dispatches on startup and after every blueprint change.
async fn watch_blueprint(ctx: Arc<ReactorContext>) {
    let mut blueprint = ctx.blueprints.watch_blueprint(&ctx.namespace);
    loop {
        blueprint.mark_unchanged();
        ctx.pump();

        tokio::select! {
            () = ctx.shutdown.cancelled() => break,
            res = blueprint.changed() => {
                if res.is_err() {
                    break;
                }
            }
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Why an activity ended early or the reactor could not run.
#[derive(thiserror::Error, Debug)]
pub enum ReactorError {
    #[error(transparent)]
    Backfill(#[from] BackfillError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Region(#[from] RegionError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The primary being tracked, or its write stream, went away.
    #[error("upstream {peer} is unreachable")]
    UpstreamLost { peer: PeerId },

    #[error("reactor must be started inside a tokio runtime")]
    NoRuntime,

    #[error("activities did not stop within {0:?}")]
    ShutdownTimeout(Duration),
}

impl ReactorError {
    /// Returns true if a remote peer or session vanished. Dispatch recovers
    /// from these by running the region's activity again.
    pub fn is_lost(&self) -> bool {
        match self {
            ReactorError::UpstreamLost { .. } => true,
            ReactorError::Backfill(e) => e.is_lost(),
            _ => false,
        }
    }
}

/// Result type for reactor operations.
pub type Result<T> = std::result::Result<T, ReactorError>;
