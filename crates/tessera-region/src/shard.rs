//! Restricting region-scoped operations to sub-regions.

use crate::{Region, RegionError, is_superset};

/// An operation that is tagged with the region it affects.
///
/// Reads, writes, and backfill chunks all implement this so they can be
/// routed to several owners and recombined later by the routing layer.
pub trait Shardable: Sized {
    /// The region this operation touches.
    fn region(&self) -> Region;

    /// Returns the part of this operation relevant to `region`.
    ///
    /// Implementations may assume `region ⊆ self.region()`; callers go
    /// through [`shard`], which checks it.
    fn restrict(&self, region: &Region) -> Self;
}

/// Restricts `op` to the part relevant to `region`.
///
/// Postcondition: the result's region is a subset of `region`.
///
/// # Errors
///
/// Returns [`RegionError::NotSubset`] if `region` is not inside the
/// operation's own region.
pub fn shard<T: Shardable>(op: &T, region: &Region) -> Result<T, RegionError> {
    let outer = op.region();
    if !is_superset(&outer, region) {
        return Err(RegionError::NotSubset {
            inner: *region,
            outer,
        });
    }

    let sharded = op.restrict(region);
    debug_assert!(
        is_superset(region, &sharded.region()),
        "shard postcondition violated: {} escapes {}",
        sharded.region(),
        region
    );
    Ok(sharded)
}
