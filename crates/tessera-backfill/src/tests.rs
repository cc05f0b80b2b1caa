//! Unit tests for tessera-backfill

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;
use tessera_region::{JoinError, Region, RegionError, RegionMap};
use tessera_store::{
    BackfillChunk, MemoryStore, ReadQuery, StoreError, StoreView, VersionMap, WriteQuery,
};
use tessera_types::{BranchId, PeerId, Version, VersionRange};
use tessera_wire::{BackfillEndpoint, BackfillRequest, BackfillerMessage, Endpoint};
use test_case::test_case;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    BackfillError, BackfillSession, Backfillee, Backfiller, SessionState, barrier_metadata,
};

const SOURCE: PeerId = PeerId::new(1);
const DEST: PeerId = PeerId::new(2);

fn v(n: u64) -> Version {
    Version::new(n)
}

fn precise(n: u64) -> VersionRange {
    VersionRange::precise(v(n))
}

/// Writes `keys` at `version` and records `version` for the whole store.
fn write_keys(store: &MemoryStore, keys: impl IntoIterator<Item = u64>, version: Version) {
    write_range(store, keys, VersionRange::precise(version));
}

/// Writes `keys` at `range.latest()` and records `range` for the whole store.
fn write_range(store: &MemoryStore, keys: impl IntoIterator<Item = u64>, range: VersionRange) {
    let version = range.latest();
    let mut txn = store.begin_write();
    for key in keys {
        let value = Bytes::from(format!("{key}@{version}"));
        txn.write(&WriteQuery::set(key, value), version).unwrap();
    }
    txn.set_metadata(VersionMap::new(store.region(), range)).unwrap();
    txn.commit().unwrap();
}

fn contents(store: &MemoryStore, region: Region) -> BTreeMap<u64, Bytes> {
    store
        .begin_read()
        .read(&ReadQuery::new(region))
        .unwrap()
        .entries
}

fn metadata(store: &MemoryStore, region: Region) -> VersionMap {
    store.begin_read().get_metadata(&region).unwrap()
}

fn spawn_backfiller(
    peer: PeerId,
    store: Arc<MemoryStore>,
    chunk_size: usize,
) -> (Endpoint<BackfillerMessage>, CancellationToken) {
    let (endpoint, mailbox) = Endpoint::channel(peer, 16);
    let shutdown = CancellationToken::new();
    let backfiller = Backfiller::new(peer, store).with_chunk_size(chunk_size);
    tokio::spawn(backfiller.run(mailbox, shutdown.clone()));
    (endpoint, shutdown)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ============================================================================
// Session State Machine
// ============================================================================

#[test_case(SessionState::Requesting, SessionState::AwaitingEndpoint, true; "request sent")]
#[test_case(SessionState::AwaitingEndpoint, SessionState::Streaming, true; "barrier passed")]
#[test_case(SessionState::Streaming, SessionState::Completing, true; "done received")]
#[test_case(SessionState::Completing, SessionState::Done, true; "end recorded")]
#[test_case(SessionState::Streaming, SessionState::Cancelled, true; "cancel mid stream")]
#[test_case(SessionState::Requesting, SessionState::Streaming, false; "skips endpoint")]
#[test_case(SessionState::Done, SessionState::Cancelled, false; "cancel after done")]
#[test_case(SessionState::Cancelled, SessionState::Cancelled, false; "cancel twice")]
fn session_transitions(from: SessionState, to: SessionState, legal: bool) {
    assert_eq!(from.can_transition_to(to), legal);
}

#[test]
fn new_session_starts_requesting() {
    let session = BackfillSession::new(SOURCE, Region::range(0, 10), VersionMap::default());
    assert_eq!(session.state(), SessionState::Requesting);
}

// ============================================================================
// Barrier Merge
// ============================================================================

#[test]
fn barrier_widens_each_overlap() {
    let start = RegionMap::from_parts([
        (Region::range(0, 30), precise(1)),
        (Region::range(30, 100), precise(4)),
    ])
    .unwrap();
    let end = RegionMap::from_parts([
        (Region::range(0, 60), precise(7)),
        (Region::range(60, 100), precise(9)),
    ])
    .unwrap();

    let merged = barrier_metadata(&start, &end).unwrap();
    let entries: Vec<_> = merged.iter().map(|(r, vr)| (*r, *vr)).collect();
    assert_eq!(
        entries,
        vec![
            (Region::range(0, 30), VersionRange::new(v(1), v(7)).unwrap()),
            (Region::range(30, 60), VersionRange::new(v(4), v(7)).unwrap()),
            (Region::range(60, 100), VersionRange::new(v(4), v(9)).unwrap()),
        ]
    );
    assert_eq!(merged.domain(), Region::range(0, 100));
}

#[test]
fn barrier_starts_from_zero_when_end_is_older() {
    let start = VersionMap::new(Region::range(0, 10), precise(5));
    let end = VersionMap::new(Region::range(0, 10), precise(3));

    let merged = barrier_metadata(&start, &end).unwrap();
    assert_eq!(merged.uniform_value(), Some(&VersionRange::new(Version::ZERO, v(3)).unwrap()));
}

#[test]
fn barrier_starts_from_zero_across_branches() {
    let ours = BranchId::generate();
    let theirs = BranchId::generate();
    let start = RegionMap::from_parts([
        (Region::range(0, 50), VersionRange::on_branch(ours, v(2))),
        (Region::range(50, 100), VersionRange::on_branch(theirs, v(2))),
    ])
    .unwrap();
    let end = VersionMap::new(Region::range(0, 100), VersionRange::on_branch(ours, v(6)));

    let merged = barrier_metadata(&start, &end).unwrap();
    let entries: Vec<_> = merged.iter().map(|(r, vr)| (*r, *vr)).collect();
    let in_flight = VersionRange::new(v(2), v(6)).unwrap().with_branch(Some(ours));
    assert_eq!(
        entries,
        vec![
            (Region::range(0, 50), in_flight),
            (Region::range(50, 100), in_flight.from_scratch()),
        ]
    );
}

#[test]
fn barrier_rejects_mismatched_domains() {
    let start = VersionMap::new(Region::range(0, 10), precise(1));
    let end = VersionMap::new(Region::range(0, 20), precise(2));
    assert!(matches!(
        barrier_metadata(&start, &end),
        Err(RegionError::DomainMismatch { .. })
    ));
}

proptest! {
    /// Property: the barrier covers the start map's domain exactly and every
    /// entry runs from some start `earliest` to some end `latest`.
    #[test]
    fn barrier_partitions_domain(
        start_cuts in prop::collection::btree_set(1u64..100, 0..6),
        end_cuts in prop::collection::btree_set(1u64..100, 0..6),
        start_version in 1u64..10,
        end_version in 10u64..20,
    ) {
        let split = |cuts: &std::collections::BTreeSet<u64>, version: u64| {
            let mut bounds = vec![0];
            bounds.extend(cuts.iter().copied());
            bounds.push(100);
            RegionMap::from_parts(
                bounds.windows(2).map(|w| (Region::range(w[0], w[1]), precise(version))),
            )
            .unwrap()
        };
        let start = split(&start_cuts, start_version);
        let end = split(&end_cuts, end_version);

        let merged = barrier_metadata(&start, &end).unwrap();
        let regions: Vec<Region> = merged.iter().map(|(r, _)| *r).collect();
        prop_assert_eq!(tessera_region::join(&regions).unwrap(), Region::range(0, 100));
        for (_, range) in merged.iter() {
            prop_assert_eq!(range.earliest(), v(start_version));
            prop_assert_eq!(range.latest(), v(end_version));
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn region_errors_are_classified() {
    let overlap = JoinError::Overlap(Region::range(0, 5), Region::range(3, 8));
    assert_eq!(
        BackfillError::from(RegionError::Join(overlap.clone())),
        BackfillError::Overlap(overlap)
    );

    let out_of_range = StoreError::OutOfRange {
        requested: Region::range(0, 200),
        store: Region::range(0, 100),
    };
    assert!(matches!(
        BackfillError::from(out_of_range),
        BackfillError::BadRegion(RegionError::NotSubset { .. })
    ));
}

#[test]
fn only_liveness_errors_are_lost() {
    assert!(BackfillError::ResourceLost.is_lost());
    assert!(BackfillError::Protocol("stray".into()).is_lost());
    assert!(!BackfillError::Interrupted.is_lost());
}

// ============================================================================
// Backfiller
// ============================================================================

/// Source at V2 answers a request from V1 with exactly one endpoint, then
/// chunks, then done; the chunks bring a V1 copy up to V2.
#[tokio::test]
async fn backfiller_streams_endpoint_chunks_then_done() {
    let source = Arc::new(MemoryStore::new(Region::range(0, 100)));
    write_keys(&source, [1, 2, 3, 70], v(1));
    write_keys(&source, [2, 40, 49, 80], v(2));

    let dest = MemoryStore::new(Region::range(0, 50));
    write_keys(&dest, [1, 2, 3], v(1));

    let (backfiller, _shutdown) = spawn_backfiller(SOURCE, Arc::clone(&source), 2);

    let (reply_to, mut reply_rx) = Endpoint::channel(DEST, 4);
    let (chunk_to, mut chunk_rx) = Endpoint::channel(DEST, 64);
    let (done_to, mut done_rx) = Endpoint::channel(DEST, 4);
    let session_id = tessera_types::SessionId::generate();
    let region = Region::range(0, 50);
    backfiller
        .send(
            BackfillRequest {
                session_id,
                region,
                start_version_map: VersionMap::new(region, precise(1)),
                reply_to,
                chunk_to,
                done_to,
            }
            .into(),
        )
        .await
        .unwrap();

    let BackfillEndpoint {
        session_id: reply_session,
        end_version_map,
    } = reply_rx.recv().await.unwrap();
    assert_eq!(reply_session, session_id);
    assert_eq!(end_version_map, VersionMap::new(region, precise(2)));

    let done = done_rx.recv().await.unwrap();
    assert_eq!(done.session_id, session_id);

    let mut chunks = Vec::new();
    while let Ok(chunk) = chunk_rx.try_recv() {
        chunks.push(chunk);
    }
    assert!(!chunks.is_empty());
    assert!(chunks.iter().all(|c| c.atom_count() <= 2));
    assert!(chunks.iter().all(|c| tessera_region::is_superset(&region, &c.region)));

    // the session closes its mailboxes once done
    assert!(reply_rx.recv().await.is_none());
    assert!(done_rx.recv().await.is_none());

    let mut txn = dest.begin_write();
    for chunk in &chunks {
        txn.receive_backfill(chunk).unwrap();
    }
    txn.commit().unwrap();
    assert_eq!(contents(&dest, region), contents(&source, region));
}

#[tokio::test]
async fn backfiller_rejects_region_outside_store() {
    let source = Arc::new(MemoryStore::new(Region::range(0, 100)));
    let (backfiller, _shutdown) = spawn_backfiller(SOURCE, source, 8);

    let dest = Arc::new(MemoryStore::new(Region::range(0, 200)));
    let backfillee = Backfillee::new(DEST, dest);
    let err = backfillee
        .run(&backfiller, Region::range(50, 150), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err, BackfillError::ResourceLost);
}

// ============================================================================
// Backfillee
// ============================================================================

#[tokio::test]
async fn backfillee_converges_to_source() {
    let source = Arc::new(MemoryStore::new(Region::range(0, 100)));
    write_keys(&source, 0..20, v(3));
    write_keys(&source, [5, 50, 99], v(8));
    let (backfiller, _shutdown) = spawn_backfiller(SOURCE, Arc::clone(&source), 4);

    let dest = Arc::new(MemoryStore::new(Region::range(0, 100)));
    let backfillee = Backfillee::new(DEST, Arc::clone(&dest) as Arc<dyn StoreView>);
    let end = backfillee
        .run(&backfiller, Region::range(0, 100), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(end, VersionMap::new(Region::range(0, 100), precise(8)));
    assert_eq!(metadata(&dest, Region::range(0, 100)), end);
    assert_eq!(
        contents(&dest, Region::range(0, 100)),
        contents(&source, Region::range(0, 100))
    );
}

/// A destination that moved past the source drops what the source never
/// had and ends at the source's version.
#[tokio::test]
async fn backfillee_discards_data_the_source_never_had() {
    let region = Region::range(0, 100);
    let source = Arc::new(MemoryStore::new(region));
    write_keys(&source, [2], v(3));
    let (backfiller, _shutdown) = spawn_backfiller(SOURCE, Arc::clone(&source), 4);

    let dest = Arc::new(MemoryStore::new(region));
    write_keys(&dest, [1], v(10));
    let end = Backfillee::new(DEST, Arc::clone(&dest) as Arc<dyn StoreView>)
        .run(&backfiller, region, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(end, VersionMap::new(region, precise(3)));
    assert_eq!(metadata(&dest, region), end);
    assert_eq!(contents(&dest, region).keys().copied().collect::<Vec<_>>(), vec![2]);
    assert_eq!(contents(&dest, region), contents(&source, region));
}

/// Two copies at the same version on different branches hold different
/// keys; the destination takes the source's history wholesale.
#[tokio::test]
async fn backfillee_replaces_a_diverged_branch() {
    let region = Region::range(0, 100);
    let source_branch = BranchId::generate();
    let source = Arc::new(MemoryStore::new(region));
    write_range(&source, [10, 11, 12], VersionRange::on_branch(source_branch, v(3)));
    let (backfiller, _shutdown) = spawn_backfiller(SOURCE, Arc::clone(&source), 2);

    let dest = Arc::new(MemoryStore::new(region));
    write_range(&dest, [1, 2, 3], VersionRange::on_branch(BranchId::generate(), v(3)));
    let end = Backfillee::new(DEST, Arc::clone(&dest) as Arc<dyn StoreView>)
        .run(&backfiller, region, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        end.uniform_value(),
        Some(&VersionRange::on_branch(source_branch, v(3)))
    );
    assert_eq!(contents(&dest, region), contents(&source, region));
}

#[tokio::test]
async fn backfillee_reports_lost_source() {
    let (source, mut mailbox) = Endpoint::<BackfillerMessage>::channel(SOURCE, 4);
    let dest = Arc::new(MemoryStore::new(Region::range(0, 100)));
    let backfillee = Backfillee::new(DEST, dest);

    let fake_source = tokio::spawn(async move {
        // take the request, then vanish without answering
        let _request = mailbox.recv().await;
    });

    let err = backfillee
        .run(&source, Region::range(0, 100), &CancellationToken::new())
        .await
        .unwrap_err();
    fake_source.await.unwrap();
    assert_eq!(err, BackfillError::ResourceLost);
}

#[tokio::test]
async fn backfillee_rejects_foreign_session() {
    let (source, mut mailbox) = Endpoint::<BackfillerMessage>::channel(SOURCE, 4);
    let dest = Arc::new(MemoryStore::new(Region::range(0, 100)));
    let backfillee = Backfillee::new(DEST, dest);

    tokio::spawn(async move {
        if let Some(BackfillerMessage::Request(request)) = mailbox.recv().await {
            let _ = request
                .reply_to
                .send(BackfillEndpoint {
                    session_id: tessera_types::SessionId::generate(),
                    end_version_map: request.start_version_map.clone(),
                })
                .await;
            // keep the session mailboxes open until the destination gives up
            request.done_to.closed().await;
        }
    });

    let err = backfillee
        .run(&source, Region::range(0, 100), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BackfillError::Protocol(_)));
}

/// Chunks that arrive before the endpoint are held, not dropped.
#[tokio::test]
async fn early_chunks_are_applied_after_barrier() {
    let (source, mut mailbox) = Endpoint::<BackfillerMessage>::channel(SOURCE, 4);
    let dest = Arc::new(MemoryStore::new(Region::range(0, 100)));
    let backfillee = Backfillee::new(DEST, Arc::clone(&dest) as Arc<dyn StoreView>);
    let region = Region::range(0, 100);

    tokio::spawn(async move {
        let Some(BackfillerMessage::Request(request)) = mailbox.recv().await else {
            return;
        };
        let chunk = BackfillChunk::key_values(vec![tessera_store::BackfillAtom {
            key: 7,
            value: Some(Bytes::from_static(b"early")),
            recency: v(5),
        }])
        .unwrap();
        request.chunk_to.send(chunk).await.unwrap();
        request
            .reply_to
            .send(BackfillEndpoint {
                session_id: request.session_id,
                end_version_map: VersionMap::new(region, precise(5)),
            })
            .await
            .unwrap();
        request
            .done_to
            .send(tessera_wire::BackfillDone {
                session_id: request.session_id,
            })
            .await
            .unwrap();
    });

    backfillee
        .run(&source, region, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        contents(&dest, region).get(&7),
        Some(&Bytes::from_static(b"early"))
    );
    assert_eq!(metadata(&dest, region).uniform_value(), Some(&precise(5)));
}

/// Cancelling mid-stream notifies the source, returns `Interrupted`, and
/// leaves applied chunks and the in-flight metadata in place.
#[tokio::test]
async fn cancel_mid_stream_notifies_source() {
    let (source, mut mailbox) = Endpoint::<BackfillerMessage>::channel(SOURCE, 4);
    let dest = Arc::new(MemoryStore::new(Region::range(0, 100)));
    let region = Region::range(0, 100);
    let cancel = CancellationToken::new();

    let (seen_tx, mut seen_rx) = mpsc::channel(1);
    let fake_source = tokio::spawn(async move {
        let Some(BackfillerMessage::Request(request)) = mailbox.recv().await else {
            panic!("expected a request");
        };
        let session_id = request.session_id;
        request
            .reply_to
            .send(BackfillEndpoint {
                session_id,
                end_version_map: VersionMap::new(region, precise(9)),
            })
            .await
            .unwrap();
        let chunk = BackfillChunk::key_values(vec![tessera_store::BackfillAtom {
            key: 1,
            value: Some(Bytes::from_static(b"one")),
            recency: v(9),
        }])
        .unwrap();
        request.chunk_to.send(chunk).await.unwrap();
        seen_tx.send(()).await.unwrap();

        // never sends done; wait for the cancel
        match mailbox.recv().await {
            Some(BackfillerMessage::Cancel(cancel)) => cancel.session_id == session_id,
            _ => false,
        }
    });

    let task = {
        let dest = Arc::clone(&dest) as Arc<dyn StoreView>;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            Backfillee::new(DEST, dest)
                .run(&source, region, &cancel)
                .await
        })
    };

    seen_rx.recv().await.unwrap();
    let applied = Arc::clone(&dest);
    wait_until(move || contents(&applied, region).contains_key(&1)).await;
    cancel.cancel();
    // idempotent
    cancel.cancel();

    assert_eq!(task.await.unwrap(), Err(BackfillError::Interrupted));
    assert!(fake_source.await.unwrap(), "source saw matching cancel");
    assert!(contents(&dest, region).contains_key(&1));
    assert_eq!(
        metadata(&dest, region).uniform_value(),
        Some(&VersionRange::new(Version::ZERO, v(9)).unwrap())
    );
}

#[tokio::test]
async fn cancel_before_request_is_interrupted() {
    let (source, _mailbox) = Endpoint::<BackfillerMessage>::channel(SOURCE, 4);
    let dest = Arc::new(MemoryStore::new(Region::range(0, 100)));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = Backfillee::new(DEST, dest)
        .run(&source, Region::range(0, 100), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err, BackfillError::Interrupted);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: backfilling twice from the same source state and the same
    /// start state yields the same end version map and the same data.
    #[test]
    fn backfill_is_deterministic(
        base in prop::collection::btree_set(0u64..64, 0..16),
        later in prop::collection::btree_set(0u64..64, 0..16),
        chunk_size in 1usize..6,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let region = Region::range(0, 64);
        let outcomes = runtime.block_on(async {
            let source = Arc::new(MemoryStore::new(region));
            write_keys(&source, base.iter().copied(), v(1));
            write_keys(&source, later.iter().copied(), v(2));
            let (backfiller, shutdown) = spawn_backfiller(SOURCE, source, chunk_size);

            let mut outcomes = Vec::new();
            for _ in 0..2 {
                let dest = Arc::new(MemoryStore::new(region));
                write_keys(&dest, base.iter().copied(), v(1));
                let end = Backfillee::new(DEST, Arc::clone(&dest) as Arc<dyn StoreView>)
                    .run(&backfiller, region, &CancellationToken::new())
                    .await
                    .unwrap();
                outcomes.push((end, contents(&dest, region)));
            }
            shutdown.cancel();
            outcomes
        });

        prop_assert_eq!(&outcomes[0], &outcomes[1]);
        prop_assert_eq!(&outcomes[0].0, &VersionMap::new(region, precise(2)));
    }
}
