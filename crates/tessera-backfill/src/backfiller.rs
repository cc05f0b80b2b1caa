//! The source side of a backfill.

use std::collections::HashMap;
use std::sync::Arc;

use tessera_region::is_superset;
use tessera_store::{BackfillChunk, StoreView, VersionMap};
use tessera_types::{PeerId, SessionId};
use tessera_wire::{BackfillDone, BackfillEndpoint, BackfillRequest, BackfillerMessage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::{BackfillError, Result};

/// Default number of key/value atoms per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 64;

/// Serves backfill sessions from one store.
///
/// Each request is answered from a single read snapshot taken when the
/// request is handled. The snapshot's chunks are then streamed by a session
/// task, so the mailbox keeps serving new requests and cancellations.
pub struct Backfiller {
    peer: PeerId,
    store: Arc<dyn StoreView>,
    chunk_size: usize,
    sessions: HashMap<SessionId, CancellationToken>,
    tracker: TaskTracker,
}

impl Backfiller {
    pub fn new(peer: PeerId, store: Arc<dyn StoreView>) -> Self {
        Self {
            peer,
            store,
            chunk_size: DEFAULT_CHUNK_SIZE,
            sessions: HashMap::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Sets the maximum number of atoms per key/value chunk.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Serves `mailbox` until it closes or `shutdown` fires, then cancels and
    /// drains every running session.
    pub async fn run(
        mut self,
        mut mailbox: mpsc::Receiver<BackfillerMessage>,
        shutdown: CancellationToken,
    ) {
        tracing::debug!(peer = %self.peer, region = %self.store.region(), "backfiller started");
        loop {
            let msg = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                msg = mailbox.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            match msg {
                BackfillerMessage::Request(request) => self.serve(request, &shutdown),
                BackfillerMessage::Cancel(cancel) => {
                    if let Some(token) = self.sessions.remove(&cancel.session_id) {
                        tracing::debug!(
                            peer = %self.peer,
                            session = %cancel.session_id,
                            "backfill cancelled by destination"
                        );
                        token.cancel();
                    }
                }
            }
        }

        for token in self.sessions.values() {
            token.cancel();
        }
        self.tracker.close();
        self.tracker.wait().await;
        tracing::debug!(peer = %self.peer, "backfiller stopped");
    }

    fn serve(&mut self, request: BackfillRequest, shutdown: &CancellationToken) {
        self.sessions.retain(|_, token| !token.is_cancelled());

        let session_id = request.session_id;
        let (end_version_map, chunks) = match self.snapshot(&request) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // Dropping the request closes its reply mailbox, which the
                // destination sees as a lost source.
                tracing::warn!(
                    peer = %self.peer,
                    session = %session_id,
                    region = %request.region,
                    error = %e,
                    "rejecting backfill request"
                );
                return;
            }
        };

        tracing::debug!(
            peer = %self.peer,
            session = %session_id,
            destination = %request.reply_to.peer(),
            region = %request.region,
            end = %end_version_map,
            chunks = chunks.len(),
            "serving backfill"
        );

        let token = shutdown.child_token();
        self.sessions.insert(session_id, token.clone());
        self.tracker.spawn(stream_session(request, end_version_map, chunks, token));
    }

    /// Reads the end version map and every chunk from one read transaction.
    fn snapshot(&self, request: &BackfillRequest) -> Result<(VersionMap, Vec<BackfillChunk>)> {
        let store_region = self.store.region();
        if !is_superset(&store_region, &request.region) {
            return Err(BackfillError::BadRegion(tessera_region::RegionError::NotSubset {
                inner: request.region,
                outer: store_region,
            }));
        }
        if request.start_version_map.domain() != request.region {
            return Err(BackfillError::BadRegion(tessera_region::RegionError::DomainMismatch {
                left: request.start_version_map.domain(),
                right: request.region,
            }));
        }

        let txn = self.store.begin_read();
        let end_version_map = txn.get_metadata(&request.region)?;
        let chunks = txn.backfill_chunks(&request.start_version_map, self.chunk_size)?;
        Ok((end_version_map, chunks))
    }
}

async fn stream_session(
    request: BackfillRequest,
    end_version_map: VersionMap,
    chunks: Vec<BackfillChunk>,
    token: CancellationToken,
) {
    let session_id = request.session_id;
    let outcome = tokio::select! {
        biased;
        () = token.cancelled() => Err(BackfillError::Interrupted),
        sent = send_all(&request, end_version_map, chunks) => sent,
    };

    match outcome {
        Ok(()) => tracing::debug!(session = %session_id, "backfill sent"),
        // Cancelled, or the destination went away: nothing left to clean up.
        Err(e) => tracing::debug!(session = %session_id, reason = %e, "backfill session ended"),
    }
    token.cancel();
}

async fn send_all(
    request: &BackfillRequest,
    end_version_map: VersionMap,
    chunks: Vec<BackfillChunk>,
) -> Result<()> {
    let session_id = request.session_id;
    request
        .reply_to
        .send(BackfillEndpoint {
            session_id,
            end_version_map,
        })
        .await
        .map_err(|_| BackfillError::ResourceLost)?;

    for chunk in chunks {
        request
            .chunk_to
            .send(chunk)
            .await
            .map_err(|_| BackfillError::ResourceLost)?;
    }

    request
        .done_to
        .send(BackfillDone { session_id })
        .await
        .map_err(|_| BackfillError::ResourceLost)
}

impl std::fmt::Debug for Backfiller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backfiller")
            .field("peer", &self.peer)
            .field("chunk_size", &self.chunk_size)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}
