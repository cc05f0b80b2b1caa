//! tessera-backfill: Backfill protocol for `Tessera`
//!
//! A backfill brings a replica's copy of a region up to date from a source
//! peer: one consistent snapshot, streamed as ordered chunks.
//!
//! # Roles
//!
//! - [`Backfillee`]: the destination. Drives one session through
//!   [`SessionState`] and returns the version its store converged to.
//! - [`Backfiller`]: the source. Serves any number of concurrent sessions
//!   from one mailbox, each from a single read snapshot.
//!
//! # Ordering
//!
//! The destination widens its version metadata to `start.earliest ..=
//! end.latest` before applying any chunk (the barrier), applies chunks in
//! receive order with one write transaction each, and only records the
//! precise end version once the source reports the session done. A reader
//! that sees a ranged version knows the region is mid-transfer.

use tessera_region::{JoinError, Region, RegionError};
use tessera_store::{StoreError, VersionMap};
use tessera_types::{PeerId, SessionId};

mod backfillee;
mod backfiller;

pub use backfillee::{Backfillee, barrier_metadata};
pub use backfiller::{Backfiller, DEFAULT_CHUNK_SIZE};

// ============================================================================
// Sessions
// ============================================================================

/// Progress of a backfill session, as seen by the destination.
///
/// ```text
/// Requesting -> AwaitingEndpoint -> Streaming -> Completing -> Done
///      \               \                \             \
///       +---------------+----------------+-------------+--> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Requesting,
    AwaitingEndpoint,
    Streaming,
    Completing,
    Done,
    Cancelled,
}

impl SessionState {
    /// Returns true if no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Done | SessionState::Cancelled)
    }

    /// Returns true if `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::{AwaitingEndpoint, Cancelled, Completing, Done, Requesting, Streaming};
        matches!(
            (self, next),
            (Requesting, AwaitingEndpoint)
                | (AwaitingEndpoint, Streaming)
                | (Streaming, Completing)
                | (Completing, Done)
        ) || (next == Cancelled && !self.is_terminal())
    }
}

/// One backfill attempt, owned by the destination.
#[derive(Debug, Clone)]
pub struct BackfillSession {
    pub session_id: SessionId,
    pub source: PeerId,
    pub region: Region,
    pub start_version_map: VersionMap,
    state: SessionState,
}

impl BackfillSession {
    pub fn new(source: PeerId, region: Region, start_version_map: VersionMap) -> Self {
        Self {
            session_id: SessionId::generate(),
            source,
            region,
            start_version_map,
            state: SessionState::Requesting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Moves the session to `next`.
    ///
    /// # Panics
    ///
    /// Panics in debug builds on an illegal transition.
    pub fn transition(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal backfill transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::debug!(
            session = %self.session_id,
            source = %self.source,
            region = %self.region,
            from = ?self.state,
            to = ?next,
            "backfill session transition"
        );
        self.state = next;
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors that end a backfill session.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BackfillError {
    /// The source peer or session disappeared.
    #[error("backfill source is unreachable")]
    ResourceLost,

    /// The caller cancelled the session.
    #[error("backfill interrupted")]
    Interrupted,

    /// Region arithmetic failed; the blueprint or a peer is malformed.
    #[error("bad region in backfill: {0}")]
    BadRegion(RegionError),

    /// Two regions that must be disjoint share keys.
    #[error("overlapping regions in backfill: {0}")]
    Overlap(JoinError),

    /// The source sent something that does not belong to this session.
    #[error("backfill protocol violation: {0}")]
    Protocol(String),

    /// The local store failed.
    #[error("store error during backfill: {0}")]
    Store(StoreError),
}

impl BackfillError {
    /// Returns true for errors that mean "pick another source", as opposed to
    /// cancellation or a malformed region.
    pub fn is_lost(&self) -> bool {
        matches!(self, BackfillError::ResourceLost | BackfillError::Protocol(_))
    }
}

impl From<RegionError> for BackfillError {
    fn from(err: RegionError) -> Self {
        match err {
            RegionError::Join(overlap @ JoinError::Overlap(..)) => BackfillError::Overlap(overlap),
            other => BackfillError::BadRegion(other),
        }
    }
}

impl From<StoreError> for BackfillError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Region(region) => region.into(),
            StoreError::OutOfRange { requested, store } => {
                BackfillError::BadRegion(RegionError::NotSubset {
                    inner: requested,
                    outer: store,
                })
            }
            other @ (StoreError::Unavailable(_) | StoreError::VersionExhausted(_)) => BackfillError::Store(other),
        }
    }
}

/// Result type for backfill operations.
pub type Result<T> = std::result::Result<T, BackfillError>;

#[cfg(test)]
mod tests;
