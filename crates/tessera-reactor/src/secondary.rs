//! Tracking a primary's write stream.

use std::sync::Arc;

use tessera_backfill::{BackfillError, Backfillee};
use tessera_directory::ShardActivity;
use tessera_region::{Region, RegionMap, Shardable, intersection, shard};
use tessera_store::max_version;
use tessera_types::{BranchId, PeerId, VersionRange};
use tessera_wire::{BackfillerMessage, BroadcastMessage, Endpoint, StreamedWrite, Subscription};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::context::{ReactorContext, wait_for_change};
use crate::{ReactorError, Result};

pub(crate) async fn run(
    ctx: &Arc<ReactorContext>,
    region: Region,
    primary: PeerId,
    cancel: &CancellationToken,
) -> Result<()> {
    let outcome = follow(ctx, region, primary, cancel).await;
    if let Err(e) = ctx.publish_cold(region) {
        tracing::error!(peer = %ctx.peer, region = %region, error = %e, "failed to downgrade secondary");
    }
    outcome
}

/// What a secondary needs from the primary it follows.
struct Upstream {
    branch_id: BranchId,
    broadcast_endpoint: Endpoint<BroadcastMessage>,
    backfill_endpoint: Endpoint<BackfillerMessage>,
}

async fn follow(
    ctx: &Arc<ReactorContext>,
    region: Region,
    primary: PeerId,
    cancel: &CancellationToken,
) -> Result<()> {
    let Some(upstream) = find_primary(ctx, region, primary, cancel).await? else {
        return Ok(());
    };
    let lost = || ReactorError::UpstreamLost { peer: primary };

    // Subscribe before backfilling so no write falls between the snapshot
    // and the stream.
    let (listener, mut stream) =
        Endpoint::<StreamedWrite>::channel(ctx.peer, ctx.config.mailbox.listener_capacity);
    let (resp, reply) = oneshot::channel();
    tokio::select! {
        biased;
        () = cancel.cancelled() => return Ok(()),
        sent = upstream.broadcast_endpoint.send(BroadcastMessage::Subscribe { listener, resp }) => {
            sent.map_err(|_| lost())?;
        }
    }
    let subscription = tokio::select! {
        biased;
        () = cancel.cancelled() => return Ok(()),
        reply = reply => reply.map_err(|_| lost())?,
    };
    if subscription.branch_id != upstream.branch_id {
        return Err(lost());
    }

    let mut version = if is_caught_up(ctx, region, &subscription)? {
        subscription.version
    } else {
        let backfillee = Backfillee::new(ctx.peer, Arc::clone(&ctx.store))
            .with_chunk_mailbox(ctx.config.backfill.chunk_mailbox);
        match backfillee.run(&upstream.backfill_endpoint, region, cancel).await {
            Ok(end) => max_version(&end),
            Err(BackfillError::Interrupted) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    };

    ctx.publish(
        region,
        ShardActivity::Secondary {
            branch_id: upstream.branch_id,
            backfill_endpoint: ctx.backfill_endpoint.clone(),
        },
    )?;
    tracing::info!(
        peer = %ctx.peer,
        primary = %primary,
        region = %region,
        branch = %upstream.branch_id,
        version = %version,
        "tracking primary"
    );

    loop {
        let write = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            write = stream.recv() => write.ok_or_else(lost)?,
        };
        // Already covered by the backfill snapshot.
        if write.version <= version {
            continue;
        }
        apply(ctx, region, upstream.branch_id, &write)?;
        version = write.version;
    }
}

/// Waits for `primary` to advertise one `Primary` entry over all of
/// `region`, offering local data as `Cold` meanwhile.
async fn find_primary(
    ctx: &ReactorContext,
    region: Region,
    primary: PeerId,
    cancel: &CancellationToken,
) -> Result<Option<Upstream>> {
    let mut changes = ctx.directory.changes();
    let mut blueprint = ctx.blueprints.watch_blueprint(&ctx.namespace);
    ctx.publish_cold(region)?;

    loop {
        changes.mark_unchanged();
        blueprint.mark_unchanged();

        if let Some(upstream) = advertised_upstream(ctx, region, primary) {
            return Ok(Some(upstream));
        }
        tracing::debug!(peer = %ctx.peer, primary = %primary, region = %region, "waiting for primary");
        if !wait_for_change(&mut changes, &mut blueprint, cancel).await {
            return Ok(None);
        }
    }
}

fn advertised_upstream(ctx: &ReactorContext, region: Region, primary: PeerId) -> Option<Upstream> {
    let state = ctx.directory.watch(primary, &ctx.namespace).borrow().clone()?;
    match state.mask(&region).uniform_value()? {
        ShardActivity::Primary {
            branch_id,
            broadcast_endpoint,
            backfill_endpoint,
        } => Some(Upstream {
            branch_id: *branch_id,
            broadcast_endpoint: broadcast_endpoint.clone(),
            backfill_endpoint: backfill_endpoint.clone(),
        }),
        _ => None,
    }
}

/// Returns true if the local copy of `region` is exactly the subscribed
/// branch at the subscribed version. The same version on another branch may
/// hold different keys.
fn is_caught_up(ctx: &ReactorContext, region: Region, subscription: &Subscription) -> Result<bool> {
    let local = ctx.metadata(&region)?;
    let expected = VersionRange::on_branch(subscription.branch_id, subscription.version);
    Ok(local.domain() == region && local.uniform_value() == Some(&expected))
}

/// Applies the part of `write` inside `region` and advances the region to
/// the write's version on `branch_id`.
fn apply(
    ctx: &ReactorContext,
    region: Region,
    branch_id: BranchId,
    write: &StreamedWrite,
) -> Result<()> {
    let overlap = intersection(&region, &write.query.region());
    let mut txn = ctx.store.begin_write();
    if !overlap.is_empty() {
        txn.write(&shard(&write.query, &overlap)?, write.version)?;
    }
    txn.set_metadata(RegionMap::new(
        region,
        VersionRange::on_branch(branch_id, write.version),
    ))?;
    txn.commit()?;
    Ok(())
}
