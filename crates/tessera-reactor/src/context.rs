//! State shared by the reactor and every activity it spawns.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tessera_config::TesseraConfig;
use tessera_directory::{
    Blueprint, BlueprintWatcher, Directory, ManagerState, ShardActivity, validate_blueprint,
};
use tessera_region::{Region, RegionMap};
use tessera_store::{StoreView, VersionMap};
use tessera_types::{Namespace, PeerId, Version};
use tessera_wire::{BackfillerMessage, Endpoint};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::desired::{DesiredActivity, desired_map};
use crate::{Result, nothing, primary, secondary};

pub(crate) struct ReactorContext {
    pub peer: PeerId,
    pub namespace: Namespace,
    pub store: Arc<dyn StoreView>,
    pub directory: Directory,
    pub blueprints: BlueprintWatcher,
    /// Where this peer's backfiller listens; advertised by every data-holding activity.
    pub backfill_endpoint: Endpoint<BackfillerMessage>,
    pub config: TesseraConfig,
    pub shutdown: CancellationToken,
    pub tracker: TaskTracker,
    runtime: Handle,
    /// Regions with a running activity. Pairwise disjoint.
    active_regions: Mutex<Vec<Region>>,
    published: Mutex<ManagerState>,
    failures: AtomicU64,
}

impl ReactorContext {
    pub fn new(
        peer: PeerId,
        store: Arc<dyn StoreView>,
        directory: Directory,
        blueprints: BlueprintWatcher,
        backfill_endpoint: Endpoint<BackfillerMessage>,
        config: TesseraConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            peer,
            namespace: Namespace::new(config.reactor.namespace.clone()),
            store,
            directory,
            blueprints,
            backfill_endpoint,
            config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            runtime,
            active_regions: Mutex::new(Vec::new()),
            published: Mutex::new(ManagerState::new(Region::universe(), ShardActivity::Inactive)),
            failures: AtomicU64::new(0),
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Spawns an activity for every desired sub-region that no running
    /// activity overlaps. Never blocks.
    pub fn pump(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let blueprint = self.blueprints.current(&self.namespace);
        if blueprint.is_empty() {
            tracing::debug!(peer = %self.peer, namespace = %self.namespace, "no blueprint yet");
            return;
        }
        if let Err(e) = validate_blueprint(&blueprint) {
            tracing::error!(peer = %self.peer, namespace = %self.namespace, error = %e, "ignoring blueprint");
            return;
        }
        let desired = desired_map(&blueprint, self.peer);

        let mut to_spawn = Vec::new();
        {
            let mut active = self.active();
            for (region, activity) in desired.iter() {
                if active.iter().any(|running| running.overlaps(region)) {
                    continue;
                }
                if *activity == DesiredActivity::Inconsistent {
                    tracing::error!(
                        peer = %self.peer,
                        region = %region,
                        "blueprint names this peer both primary and secondary"
                    );
                    continue;
                }
                active.push(*region);
                to_spawn.push((*region, *activity));
            }
            debug_assert!(is_pairwise_disjoint(&active), "active regions overlap: {active:?}");
        }

        for (region, activity) in to_spawn {
            self.spawn_activity(region, activity);
        }
    }

    fn spawn_activity(self: &Arc<Self>, region: Region, activity: DesiredActivity) {
        tracing::debug!(peer = %self.peer, region = %region, activity = %activity, "spawning activity");

        let token = self.shutdown.child_token();
        self.tracker.spawn_on(
            monitor(Arc::clone(self), region, activity, token.clone()),
            &self.runtime,
        );

        let exit = ExitGuard {
            ctx: Arc::clone(self),
            region,
            token: token.clone(),
            retry_now: false,
        };
        let ctx = Arc::clone(self);
        self.tracker.spawn_on(
            async move {
                let mut exit = exit;
                let outcome = match activity {
                    DesiredActivity::Nothing => nothing::run(&ctx, region, &token).await,
                    DesiredActivity::Primary => primary::run(&ctx, region, &token).await,
                    DesiredActivity::Secondary { primary } => {
                        secondary::run(&ctx, region, primary, &token).await
                    }
                    DesiredActivity::Inconsistent => Ok(()),
                };
                exit.retry_now = match &outcome {
                    Ok(()) => true,
                    Err(e) => e.is_lost(),
                };
                ctx.report(region, activity, outcome);
            },
            &self.runtime,
        );
    }

    fn report(&self, region: Region, activity: DesiredActivity, outcome: Result<()>) {
        match outcome {
            Ok(()) => {
                tracing::debug!(peer = %self.peer, region = %region, activity = %activity, "activity exited");
            }
            Err(e) if e.is_lost() => {
                tracing::warn!(peer = %self.peer, region = %region, activity = %activity, error = %e, "activity lost its upstream");
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(peer = %self.peer, region = %region, activity = %activity, error = %e, "activity failed");
            }
        }
    }

    /// Activities that ended with an error other than a lost peer.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Frees `region` for dispatch and dispatches again.
    fn release(self: &Arc<Self>, region: Region) {
        self.active().retain(|r| *r != region);
        if !self.shutdown.is_cancelled() {
            self.pump();
        }
    }

    fn active(&self) -> MutexGuard<'_, Vec<Region>> {
        self.active_regions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn active_regions(&self) -> Vec<Region> {
        let mut regions = self.active().clone();
        regions.sort();
        regions
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    pub fn published(&self) -> ManagerState {
        self.published_state().clone()
    }

    fn published_state(&self) -> MutexGuard<'_, ManagerState> {
        self.published.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advertises `activity` for `region`.
    pub fn publish(&self, region: Region, activity: ShardActivity) -> Result<()> {
        self.publish_map(RegionMap::new(region, activity))
    }

    /// Advertises whatever the store holds for `region`: `Cold` where there is
    /// data, `Inactive` where there is none.
    pub fn publish_cold(&self, region: Region) -> Result<()> {
        let metadata = self.metadata(&region)?;
        let state = metadata.map(|_, version| {
            if version.latest() == Version::ZERO {
                ShardActivity::Inactive
            } else {
                ShardActivity::Cold {
                    version: *version,
                    backfill_endpoint: self.backfill_endpoint.clone(),
                }
            }
        });
        self.publish_map(state)
    }

    /// Publishes the current state to the directory while holding the
    /// published-state lock, so the directory sees updates in order.
    pub fn publish_map(&self, update: ManagerState) -> Result<()> {
        let mut published = self.published_state();
        published.update(update)?;
        *published = published.coalesce();
        self.directory
            .publish(self.peer, &self.namespace, published.clone());
        Ok(())
    }

    /// Publishes the initial all-`Inactive` state.
    pub fn announce(&self) {
        let published = self.published_state();
        self.directory
            .publish(self.peer, &self.namespace, published.clone());
    }

    // ========================================================================
    // Store access (never held across an await)
    // ========================================================================

    pub fn metadata(&self, region: &Region) -> Result<VersionMap> {
        Ok(self.store.begin_read().get_metadata(region)?)
    }

    /// Drops every key in `region` and resets its metadata to zero.
    pub fn erase(&self, region: &Region) -> Result<()> {
        let mut txn = self.store.begin_write();
        txn.erase(region)?;
        txn.commit()?;
        Ok(())
    }
}

/// Waits for any directory or blueprint change. Returns false once
/// `cancel` fires or either observable is gone.
pub(crate) async fn wait_for_change(
    changes: &mut watch::Receiver<u64>,
    blueprint: &mut watch::Receiver<Blueprint>,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        res = changes.changed() => res.is_ok(),
        res = blueprint.changed() => res.is_ok(),
    }
}

/// Cancels `token` once the blueprint no longer asks for `activity` over
/// exactly `region`.
async fn monitor(
    ctx: Arc<ReactorContext>,
    region: Region,
    activity: DesiredActivity,
    token: CancellationToken,
) {
    let mut blueprint = ctx.blueprints.watch_blueprint(&ctx.namespace);
    loop {
        let still_desired = {
            let current = blueprint.borrow_and_update();
            desired_map(&current, ctx.peer)
                .iter()
                .any(|(r, a)| *r == region && *a == activity)
        };
        if !still_desired {
            tracing::debug!(peer = %ctx.peer, region = %region, activity = %activity, "monitor fired");
            token.cancel();
            return;
        }

        tokio::select! {
            () = token.cancelled() => return,
            res = blueprint.changed() => {
                if res.is_err() {
                    token.cancel();
                    return;
                }
            }
        }
    }
}

/// Exit bookkeeping for one activity: releases its region and re-runs
/// dispatch, however the activity ended.
///
/// Unless the activity finished cleanly or lost a peer, the region stays
/// reserved for the retry backoff before it is released.
struct ExitGuard {
    ctx: Arc<ReactorContext>,
    region: Region,
    token: CancellationToken,
    retry_now: bool,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.token.cancel();
        if self.retry_now || self.ctx.shutdown.is_cancelled() {
            self.ctx.release(self.region);
            return;
        }

        let ctx = Arc::clone(&self.ctx);
        let region = self.region;
        let backoff = ctx.config.retry_backoff();
        tracing::debug!(peer = %ctx.peer, region = %region, backoff = ?backoff, "delaying retry");
        self.ctx.tracker.spawn_on(
            async move {
                tokio::select! {
                    () = ctx.shutdown.cancelled() => {}
                    () = tokio::time::sleep(backoff) => {}
                }
                ctx.release(region);
            },
            &self.ctx.runtime,
        );
    }
}

pub(crate) fn is_pairwise_disjoint(regions: &[Region]) -> bool {
    regions
        .iter()
        .enumerate()
        .all(|(i, a)| regions[i + 1..].iter().all(|b| !a.overlaps(b)))
}
