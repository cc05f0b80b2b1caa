//! What a blueprint asks of one peer.

use std::fmt::Display;

use tessera_directory::{Blueprint, ShardAssignment};
use tessera_region::RegionMap;
use tessera_types::PeerId;

/// The activity a peer should run over a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DesiredActivity {
    /// Not assigned: hand the data off, then drop it.
    Nothing,
    /// Assigned primary.
    Primary,
    /// Assigned secondary, tracking `primary`.
    Secondary { primary: PeerId },
    /// Named both primary and secondary of the same shard.
    Inconsistent,
}

impl DesiredActivity {
    pub fn for_assignment(assignment: &ShardAssignment, peer: PeerId) -> Self {
        let is_primary = assignment.primary == peer;
        let is_secondary = assignment.secondaries.contains(&peer);
        match (is_primary, is_secondary) {
            (true, true) => DesiredActivity::Inconsistent,
            (true, false) => DesiredActivity::Primary,
            (false, true) => DesiredActivity::Secondary {
                primary: assignment.primary,
            },
            (false, false) => DesiredActivity::Nothing,
        }
    }
}

impl Display for DesiredActivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DesiredActivity::Nothing => write!(f, "nothing"),
            DesiredActivity::Primary => write!(f, "primary"),
            DesiredActivity::Secondary { primary } => write!(f, "secondary of {primary}"),
            DesiredActivity::Inconsistent => write!(f, "inconsistent"),
        }
    }
}

/// Partitions the blueprint's domain into maximal sub-regions over which
/// `peer`'s desired activity is constant.
///
/// The result is coalesced, so two peers reading the same blueprint compute
/// identical boundaries.
pub fn desired_map(blueprint: &Blueprint, peer: PeerId) -> RegionMap<DesiredActivity> {
    blueprint
        .map(|_, assignment| DesiredActivity::for_assignment(assignment, peer))
        .coalesce()
}
