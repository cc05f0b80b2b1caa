//! Serving a region as its primary.

use std::sync::Arc;

use tessera_backfill::{BackfillError, Backfillee};
use tessera_directory::ShardActivity;
use tessera_region::{Region, RegionMap, Shardable, is_superset, subtract_all};
use tessera_store::{ReadQuery, ReadResponse, StoreError, WriteQuery, max_version};
use tessera_types::{BranchId, PeerId, Version, VersionRange};
use tessera_wire::{
    BackfillerMessage, BroadcastMessage, Endpoint, StreamedWrite, Subscription,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::context::{ReactorContext, wait_for_change};

pub(crate) async fn run(
    ctx: &Arc<ReactorContext>,
    region: Region,
    cancel: &CancellationToken,
) -> Result<()> {
    let outcome = lead(ctx, region, cancel).await;
    // Whatever happened, the data stays advertised.
    if let Err(e) = ctx.publish_cold(region) {
        tracing::error!(peer = %ctx.peer, region = %region, error = %e, "failed to downgrade primary");
    }
    outcome
}

async fn lead(ctx: &Arc<ReactorContext>, region: Region, cancel: &CancellationToken) -> Result<()> {
    if !wait_for_exclusive(ctx, region, cancel).await? {
        return Ok(());
    }

    for planned in plan_backfills(ctx, region)? {
        tracing::info!(
            peer = %ctx.peer,
            source = %planned.source,
            region = %planned.region,
            version = %planned.version,
            "backfilling before taking over as primary"
        );
        let backfillee = Backfillee::new(ctx.peer, Arc::clone(&ctx.store))
            .with_chunk_mailbox(ctx.config.backfill.chunk_mailbox);
        match backfillee.run(&planned.endpoint, planned.region, cancel).await {
            Ok(_) => {}
            Err(BackfillError::Interrupted) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }

    let branch_id = BranchId::generate();
    let version = start_branch(ctx, region, branch_id)?;
    let (broadcast_endpoint, mailbox) =
        Endpoint::<BroadcastMessage>::channel(ctx.peer, ctx.config.mailbox.capacity);
    ctx.publish(
        region,
        ShardActivity::Primary {
            branch_id,
            broadcast_endpoint,
            backfill_endpoint: ctx.backfill_endpoint.clone(),
        },
    )?;
    tracing::info!(
        peer = %ctx.peer,
        region = %region,
        branch = %branch_id,
        version = %version,
        "serving as primary"
    );

    let mut branch = Branch {
        ctx,
        region,
        branch_id,
        version,
        listeners: Vec::new(),
    };
    branch.serve(mailbox, cancel).await;
    Ok(())
}

/// Waits until no other peer advertises `Primary` over any key of `region`.
/// Returns false if cancelled first.
async fn wait_for_exclusive(
    ctx: &ReactorContext,
    region: Region,
    cancel: &CancellationToken,
) -> Result<bool> {
    let mut changes = ctx.directory.changes();
    let mut blueprint = ctx.blueprints.watch_blueprint(&ctx.namespace);
    ctx.publish_cold(region)?;

    loop {
        changes.mark_unchanged();
        blueprint.mark_unchanged();

        let rival = ctx
            .directory
            .snapshot(&ctx.namespace)
            .into_iter()
            .find(|(peer, state)| {
                *peer != ctx.peer && state.mask(&region).values().any(ShardActivity::is_primary)
            })
            .map(|(peer, _)| peer);
        let Some(rival) = rival else {
            return Ok(true);
        };

        tracing::debug!(peer = %ctx.peer, region = %region, rival = %rival, "waiting for previous primary to step down");
        if !wait_for_change(&mut changes, &mut blueprint, cancel).await {
            return Ok(false);
        }
    }
}

// ============================================================================
// Backfill Planning
// ============================================================================

#[derive(Debug, Clone)]
pub(crate) struct PlannedBackfill {
    pub source: PeerId,
    pub region: Region,
    pub version: VersionRange,
    pub endpoint: Endpoint<BackfillerMessage>,
}

fn plan_backfills(ctx: &ReactorContext, region: Region) -> Result<Vec<PlannedBackfill>> {
    let local = ctx.metadata(&region)?;
    let mut candidates = Vec::new();
    for (peer, state) in ctx.directory.snapshot(&ctx.namespace) {
        if peer == ctx.peer {
            continue;
        }
        for (r, activity) in state.mask(&region).iter() {
            if let ShardActivity::Cold {
                version,
                backfill_endpoint,
            } = activity
            {
                candidates.push(PlannedBackfill {
                    source: peer,
                    region: *r,
                    version: *version,
                    endpoint: backfill_endpoint.clone(),
                });
            }
        }
    }
    Ok(cover(&local, candidates))
}

/// Picks, for every sub-region, the newest coherent candidate whose data is
/// newer than `local`. Ties go to the lowest peer id.
pub(crate) fn cover(
    local: &RegionMap<VersionRange>,
    mut candidates: Vec<PlannedBackfill>,
) -> Vec<PlannedBackfill> {
    candidates.retain(|c| c.version.is_coherent());
    candidates.sort_by(|a, b| {
        b.version
            .latest()
            .cmp(&a.version.latest())
            .then(a.source.cmp(&b.source))
            .then(a.region.cmp(&b.region))
    });

    let mut covered: Vec<Region> = Vec::new();
    let mut plan = Vec::new();
    for candidate in candidates {
        for (local_region, local_version) in local.mask(&candidate.region).iter() {
            let stale =
                !local_version.is_coherent() || candidate.version.latest() > local_version.latest();
            if !stale {
                continue;
            }
            let pieces = subtract_all(local_region, &covered);
            covered.extend(pieces.iter().copied());
            plan.extend(pieces.into_iter().map(|piece| PlannedBackfill {
                region: piece,
                ..candidate.clone()
            }));
        }
    }
    plan.sort_by(|a, b| a.region.cmp(&b.region));
    plan
}

/// Pins `region` to its newest local version on `branch_id` and returns
/// that version.
fn start_branch(ctx: &ReactorContext, region: Region, branch_id: BranchId) -> Result<Version> {
    let mut txn = ctx.store.begin_write();
    let version = max_version(&txn.get_metadata(&region)?);
    txn.set_metadata(RegionMap::new(region, VersionRange::on_branch(branch_id, version)))?;
    txn.commit()?;
    Ok(version)
}

// ============================================================================
// Serving
// ============================================================================

struct Branch<'a> {
    ctx: &'a ReactorContext,
    region: Region,
    branch_id: BranchId,
    version: Version,
    listeners: Vec<Endpoint<StreamedWrite>>,
}

impl Branch<'_> {
    async fn serve(&mut self, mut mailbox: mpsc::Receiver<BroadcastMessage>, cancel: &CancellationToken) {
        loop {
            let msg = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                msg = mailbox.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            match msg {
                BroadcastMessage::Write { query, resp } => {
                    let _ = resp.send(self.write(query));
                }
                BroadcastMessage::Subscribe { listener, resp } => {
                    tracing::debug!(
                        peer = %self.ctx.peer,
                        listener = %listener.peer(),
                        version = %self.version,
                        "listener subscribed"
                    );
                    self.listeners.push(listener);
                    let _ = resp.send(Subscription {
                        branch_id: self.branch_id,
                        version: self.version,
                    });
                }
                BroadcastMessage::Read { query, resp } => {
                    let _ = resp.send(self.read(&query));
                }
            }
        }
        tracing::debug!(peer = %self.ctx.peer, region = %self.region, version = %self.version, "primary stopped serving");
    }

    fn write(&mut self, query: WriteQuery) -> std::result::Result<Version, StoreError> {
        self.check(query.region())?;

        let version = self
            .version
            .checked_next()
            .ok_or(StoreError::VersionExhausted(self.version))?;
        let mut txn = self.ctx.store.begin_write();
        txn.write(&query, version)?;
        txn.set_metadata(RegionMap::new(
            self.region,
            VersionRange::on_branch(self.branch_id, version),
        ))?;
        txn.commit()?;
        self.version = version;

        let streamed = StreamedWrite { version, query };
        self.listeners.retain(|listener| match listener.try_send(streamed.clone()) {
            Ok(()) => true,
            Err(e) => {
                // A dropped listener sees its stream close and resyncs.
                tracing::debug!(version = %version, error = %e, "dropping listener");
                false
            }
        });
        Ok(version)
    }

    fn read(&self, query: &ReadQuery) -> std::result::Result<ReadResponse, StoreError> {
        self.check(query.region())?;
        self.ctx.store.begin_read().read(query)
    }

    fn check(&self, requested: Region) -> std::result::Result<(), StoreError> {
        if is_superset(&self.region, &requested) {
            Ok(())
        } else {
            Err(StoreError::OutOfRange {
                requested,
                store: self.region,
            })
        }
    }
}
