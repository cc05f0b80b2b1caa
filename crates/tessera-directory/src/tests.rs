//! Unit tests for tessera-directory

use std::collections::BTreeSet;

use tessera_region::{Region, RegionMap};
use tessera_types::{BranchId, Namespace, PeerId, Version, VersionRange};
use tessera_wire::Endpoint;
use test_case::test_case;

use crate::{
    Blueprint, BlueprintWatcher, Directory, DirectoryError, ManagerState, ShardActivity,
    ShardAssignment, validate_blueprint,
};

fn ns() -> Namespace {
    Namespace::from("default")
}

fn cold(peer: u64, version: u64) -> ShardActivity {
    let (backfill_endpoint, _rx) = Endpoint::channel(PeerId::new(peer), 1);
    ShardActivity::Cold {
        version: VersionRange::precise(Version::new(version)),
        backfill_endpoint,
    }
}

fn state(activity: ShardActivity) -> ManagerState {
    ManagerState::new(Region::universe(), activity)
}

// ============================================================================
// Shard Activities
// ============================================================================

#[test]
fn inactive_has_no_backfill_endpoint() {
    assert!(ShardActivity::Inactive.backfill_endpoint().is_none());
    assert!(ShardActivity::Inactive.is_inactive());
}

#[test]
fn data_holding_activities_expose_backfill_endpoint() {
    let (backfill_endpoint, _rx) = Endpoint::channel(PeerId::new(4), 1);
    let (broadcast_endpoint, _brx) = Endpoint::channel(PeerId::new(4), 1);

    let primary = ShardActivity::Primary {
        branch_id: BranchId::generate(),
        broadcast_endpoint,
        backfill_endpoint: backfill_endpoint.clone(),
    };
    let secondary = ShardActivity::Secondary {
        branch_id: BranchId::generate(),
        backfill_endpoint: backfill_endpoint.clone(),
    };

    assert!(primary.is_primary());
    assert!(secondary.is_secondary());
    assert_eq!(primary.backfill_endpoint(), Some(&backfill_endpoint));
    assert_eq!(secondary.backfill_endpoint(), Some(&backfill_endpoint));
}

// ============================================================================
// Blueprint
// ============================================================================

#[test_case(Region::range(0, 100); "bounded")]
#[test_case(Region::from_start(1); "missing key zero")]
#[test_case(Region::empty(); "empty")]
fn partial_blueprints_are_rejected(domain: Region) {
    let blueprint = Blueprint::new(domain, ShardAssignment::primary_only(PeerId::new(1)));
    assert_eq!(
        validate_blueprint(&blueprint),
        Err(DirectoryError::PartialBlueprint { domain })
    );
}

#[test]
fn assignment_lists_primary_first() {
    let assignment = ShardAssignment::new(
        PeerId::new(3),
        BTreeSet::from([PeerId::new(2), PeerId::new(1)]),
    );
    let peers: Vec<_> = assignment.peers().collect();
    assert_eq!(peers, vec![PeerId::new(3), PeerId::new(1), PeerId::new(2)]);
}

#[tokio::test]
async fn blueprint_watchers_see_updates() {
    let watcher = BlueprintWatcher::new();
    let mut rx = watcher.watch_blueprint(&ns());
    assert_eq!(rx.borrow().domain(), Region::empty());

    let blueprint = RegionMap::from_parts([
        (Region::range(0, 50), ShardAssignment::primary_only(PeerId::new(1))),
        (Region::from_start(50), ShardAssignment::primary_only(PeerId::new(2))),
    ])
    .unwrap();
    watcher.set(&ns(), blueprint.clone()).unwrap();

    rx.changed().await.unwrap();
    assert_eq!(*rx.borrow_and_update(), blueprint);
    assert_eq!(watcher.current(&ns()), blueprint);
}

#[test]
fn namespaces_have_independent_blueprints() {
    let watcher = BlueprintWatcher::new();
    let blueprint = Blueprint::new(
        Region::universe(),
        ShardAssignment::primary_only(PeerId::new(1)),
    );
    watcher.set(&Namespace::from("a"), blueprint).unwrap();

    assert!(watcher.current(&Namespace::from("b")).is_empty());
}

// ============================================================================
// Directory
// ============================================================================

#[tokio::test]
async fn watch_sees_published_state() {
    let directory = Directory::new();
    let mut rx = directory.watch(PeerId::new(1), &ns());
    assert!(rx.borrow().is_none());

    directory.publish(PeerId::new(1), &ns(), state(ShardActivity::Inactive));
    rx.changed().await.unwrap();
    assert_eq!(
        rx.borrow_and_update().as_ref().and_then(|s| s.lookup(42).cloned()),
        Some(ShardActivity::Inactive)
    );
}

#[tokio::test]
async fn disconnect_clears_every_namespace() {
    let directory = Directory::new();
    let other = Namespace::from("other");
    directory.publish(PeerId::new(1), &ns(), state(cold(1, 3)));
    directory.publish(PeerId::new(1), &other, state(cold(1, 3)));
    directory.publish(PeerId::new(2), &ns(), state(ShardActivity::Inactive));

    let mut rx = directory.watch(PeerId::new(1), &ns());
    directory.disconnect(PeerId::new(1));

    rx.changed().await.unwrap();
    assert!(rx.borrow().is_none());
    assert!(directory.snapshot(&other).is_empty());
    assert_eq!(
        directory.snapshot(&ns()).keys().copied().collect::<Vec<_>>(),
        vec![PeerId::new(2)]
    );
}

#[tokio::test]
async fn changes_counter_advances_on_publish_and_disconnect() {
    let directory = Directory::new();
    let mut changes = directory.changes();
    let start = *changes.borrow_and_update();

    directory.publish(PeerId::new(1), &ns(), state(ShardActivity::Inactive));
    changes.changed().await.unwrap();
    directory.disconnect(PeerId::new(1));
    changes.changed().await.unwrap();

    assert_eq!(*changes.borrow(), start + 2);
}

#[test]
fn snapshot_is_ordered_by_peer() {
    let directory = Directory::new();
    for peer in [5, 1, 3] {
        directory.publish(PeerId::new(peer), &ns(), state(cold(peer, peer)));
    }

    let peers: Vec<_> = directory.snapshot(&ns()).into_keys().collect();
    assert_eq!(peers, vec![PeerId::new(1), PeerId::new(3), PeerId::new(5)]);
}
