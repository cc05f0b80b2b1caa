//! Handing a region off and dropping it.

use std::sync::Arc;

use tessera_directory::ShardActivity;
use tessera_region::Region;
use tessera_types::Version;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::context::{ReactorContext, wait_for_change};

pub(crate) async fn run(
    ctx: &Arc<ReactorContext>,
    region: Region,
    cancel: &CancellationToken,
) -> Result<()> {
    if holds_data(ctx, region)? {
        let mut changes = ctx.directory.changes();
        let mut blueprint = ctx.blueprints.watch_blueprint(&ctx.namespace);
        ctx.publish_cold(region)?;

        loop {
            changes.mark_unchanged();
            blueprint.mark_unchanged();
            if is_handed_off(ctx, region) {
                break;
            }
            tracing::debug!(peer = %ctx.peer, region = %region, "offering region until the blueprint is satisfied");
            if !wait_for_change(&mut changes, &mut blueprint, cancel).await {
                return Ok(());
            }
        }

        ctx.erase(&region)?;
        tracing::info!(peer = %ctx.peer, region = %region, "handed off region, local data erased");
    }

    ctx.publish(region, ShardActivity::Inactive)?;
    cancel.cancelled().await;
    Ok(())
}

fn holds_data(ctx: &ReactorContext, region: Region) -> Result<bool> {
    Ok(ctx
        .metadata(&region)?
        .values()
        .any(|version| version.latest() > Version::ZERO))
}

/// True once every peer the blueprint assigns within `region` advertises
/// its role over its whole share of it.
fn is_handed_off(ctx: &ReactorContext, region: Region) -> bool {
    let blueprint = ctx.blueprints.current(&ctx.namespace).mask(&region);
    let states = ctx.directory.snapshot(&ctx.namespace);

    !blueprint.is_empty()
        && blueprint.iter().all(|(r, assignment)| {
            assignment.peers().all(|peer| {
                let Some(state) = states.get(&peer) else {
                    return false;
                };
                let is_primary = peer == assignment.primary;
                state.mask(r).values().all(|activity| {
                    if is_primary {
                        activity.is_primary()
                    } else {
                        activity.is_secondary()
                    }
                })
            })
        })
}
