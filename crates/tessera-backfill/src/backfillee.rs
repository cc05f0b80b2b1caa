//! The destination side of a backfill.

use std::sync::Arc;

use tessera_region::{Region, RegionError, RegionMap};
use tessera_store::{BackfillChunk, StoreView, VersionMap};
use tessera_types::{PeerId, VersionRange};
use tessera_wire::{
    BackfillCancel, BackfillDone, BackfillEndpoint, BackfillRequest, BackfillerMessage, Endpoint,
};
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use crate::{BackfillError, BackfillSession, Result, SessionState};

/// Default capacity of the chunk mailbox.
const DEFAULT_CHUNK_MAILBOX: usize = 64;

/// Computes the in-flight metadata written by the barrier.
///
/// Every overlap of a `start` entry with an `end` entry gets `end`'s latest
/// version and branch. Its `earliest` stays at `start.earliest` only where
/// `end` [continues from](VersionRange::continues_from) `start`; everywhere
/// else the source resends in full, so the entry starts from
/// [`Version::ZERO`](tessera_types::Version::ZERO) and a retry after an
/// interruption resends in full too. The pairwise intersections of two
/// partitions of the same region partition it too, so the result covers
/// `start.domain()` exactly whatever the alignment of the two maps'
/// boundaries.
///
/// # Errors
///
/// Returns [`RegionError::DomainMismatch`] if the maps cover different regions.
pub fn barrier_metadata(start: &VersionMap, end: &VersionMap) -> std::result::Result<VersionMap, RegionError> {
    start.zip(end, |s, e| {
        e.continues_from(s)
            .then(|| s.widen_to(e))
            .flatten()
            .unwrap_or_else(|| e.from_scratch())
    })
}

/// Pulls a region from a source peer into the local store.
pub struct Backfillee {
    peer: PeerId,
    store: Arc<dyn StoreView>,
    chunk_mailbox: usize,
}

impl Backfillee {
    /// Creates a backfillee for `peer` writing into `store`.
    pub fn new(peer: PeerId, store: Arc<dyn StoreView>) -> Self {
        Self {
            peer,
            store,
            chunk_mailbox: DEFAULT_CHUNK_MAILBOX,
        }
    }

    /// Sets how many chunks may queue before the source is throttled.
    pub fn with_chunk_mailbox(mut self, capacity: usize) -> Self {
        self.chunk_mailbox = capacity.max(1);
        self
    }

    /// Runs one session against `source` for `region`.
    ///
    /// On success the store holds the source's snapshot for `region` and its
    /// metadata equals the returned end version map.
    ///
    /// # Errors
    ///
    /// - [`BackfillError::ResourceLost`] if the source goes away
    /// - [`BackfillError::Interrupted`] if `cancel` fires; the source is told
    ///   to stop and already-applied chunks stay applied
    /// - [`BackfillError::Protocol`] if the source answers for another session
    /// - [`BackfillError::BadRegion`] / [`BackfillError::Overlap`] on malformed
    ///   region arithmetic
    pub async fn run(
        &self,
        source: &Endpoint<BackfillerMessage>,
        region: Region,
        cancel: &CancellationToken,
    ) -> Result<VersionMap> {
        let start_version_map = self.read_metadata(&region)?;
        let mut session = BackfillSession::new(source.peer(), region, start_version_map);

        let (reply_to, mut reply_rx) = Endpoint::<BackfillEndpoint>::channel(self.peer, 1);
        let (chunk_to, mut chunk_rx) = Endpoint::<BackfillChunk>::channel(self.peer, self.chunk_mailbox);
        let (done_to, mut done_rx) = Endpoint::<BackfillDone>::channel(self.peer, 1);

        let request = BackfillRequest {
            session_id: session.session_id,
            region,
            start_version_map: session.start_version_map.clone(),
            reply_to,
            chunk_to,
            done_to,
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(self.interrupt(&mut session, source)),
            sent = source.send(request.into()) => {
                if sent.is_err() {
                    return Err(BackfillError::ResourceLost);
                }
            }
        }
        session.transition(SessionState::AwaitingEndpoint);

        // Chunks that arrive before the barrier stay queued in chunk_rx.
        let endpoint = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(self.interrupt(&mut session, source)),
            reply = reply_rx.recv() => reply.ok_or(BackfillError::ResourceLost)?,
        };
        if endpoint.session_id != session.session_id {
            return Err(BackfillError::Protocol(format!(
                "endpoint for session {} received by session {}",
                endpoint.session_id, session.session_id
            )));
        }
        let end_version_map = endpoint.end_version_map;
        self.write_barrier(&session.start_version_map, &end_version_map)?;
        session.transition(SessionState::Streaming);

        let mut chunks_open = true;
        let done = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(self.interrupt(&mut session, source)),
                chunk = chunk_rx.recv(), if chunks_open => match chunk {
                    Some(chunk) => self.apply_chunk(&session, &chunk)?,
                    None => chunks_open = false,
                },
                done = done_rx.recv() => break done.ok_or(BackfillError::ResourceLost)?,
            }
        };
        if done.session_id != session.session_id {
            return Err(BackfillError::Protocol(format!(
                "done for session {} received by session {}",
                done.session_id, session.session_id
            )));
        }
        session.transition(SessionState::Completing);

        loop {
            match chunk_rx.try_recv() {
                Ok(chunk) => self.apply_chunk(&session, &chunk)?,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        self.write_end(&end_version_map)?;
        session.transition(SessionState::Done);

        tracing::debug!(
            peer = %self.peer,
            session = %session.session_id,
            region = %region,
            end = %end_version_map,
            "backfill complete"
        );
        Ok(end_version_map)
    }

    fn interrupt(
        &self,
        session: &mut BackfillSession,
        source: &Endpoint<BackfillerMessage>,
    ) -> BackfillError {
        let cancel = BackfillCancel {
            session_id: session.session_id,
        };
        // Best effort: a source that misses this notices the closed chunk
        // mailbox on its next send.
        if let Err(e) = source.try_send(cancel.into()) {
            tracing::debug!(session = %session.session_id, error = %e, "cancel not delivered");
        }
        session.transition(SessionState::Cancelled);
        BackfillError::Interrupted
    }

    fn read_metadata(&self, region: &Region) -> Result<VersionMap> {
        Ok(self.store.begin_read().get_metadata(region)?)
    }

    fn write_barrier(&self, start: &VersionMap, end: &VersionMap) -> Result<()> {
        let in_flight: RegionMap<VersionRange> = barrier_metadata(start, end)?;
        let mut txn = self.store.begin_write();
        txn.set_metadata(in_flight)?;
        txn.commit()?;
        Ok(())
    }

    fn apply_chunk(&self, session: &BackfillSession, chunk: &BackfillChunk) -> Result<()> {
        if !tessera_region::is_superset(&session.region, &chunk.region) {
            return Err(BackfillError::Protocol(format!(
                "chunk for {} outside session region {}",
                chunk.region, session.region
            )));
        }
        let mut txn = self.store.begin_write();
        txn.receive_backfill(chunk)?;
        txn.commit()?;
        Ok(())
    }

    fn write_end(&self, end: &VersionMap) -> Result<()> {
        let mut txn = self.store.begin_write();
        txn.set_metadata(end.clone())?;
        txn.commit()?;
        Ok(())
    }
}

impl std::fmt::Debug for Backfillee {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backfillee")
            .field("peer", &self.peer)
            .field("region", &self.store.region())
            .finish_non_exhaustive()
    }
}
