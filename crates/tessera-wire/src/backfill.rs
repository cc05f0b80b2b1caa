//! Backfill protocol messages.
//!
//! A session runs between a backfillee (destination) and a backfiller
//! (source):
//!
//! ```text
//! backfillee                          backfiller
//!     | -- BackfillRequest ------------> |
//!     | <------------ BackfillEndpoint -- |   reply_to, once
//!     | <------------ BackfillChunk ----- |   chunk_to, 0..n, ordered
//!     | <------------ BackfillDone ------ |   done_to, once
//!     | -- BackfillCancel --------------> |   either side, aborts
//! ```

use tessera_region::Region;
use tessera_store::{BackfillChunk, VersionMap};
use tessera_types::SessionId;

use crate::Endpoint;

/// Asks a source to bring `region` up to date from `start_version_map`.
#[derive(Debug, Clone)]
pub struct BackfillRequest {
    pub session_id: SessionId,
    pub region: Region,
    /// What the destination holds now.
    pub start_version_map: VersionMap,
    pub reply_to: Endpoint<BackfillEndpoint>,
    pub chunk_to: Endpoint<BackfillChunk>,
    pub done_to: Endpoint<BackfillDone>,
}

/// The version the session will converge to. Sent once, before any chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillEndpoint {
    pub session_id: SessionId,
    pub end_version_map: VersionMap,
}

/// Every chunk of the session has been sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillDone {
    pub session_id: SessionId,
}

/// Aborts a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillCancel {
    pub session_id: SessionId,
}

/// Everything a backfiller's mailbox accepts.
#[derive(Debug, Clone)]
pub enum BackfillerMessage {
    Request(BackfillRequest),
    Cancel(BackfillCancel),
}

impl From<BackfillRequest> for BackfillerMessage {
    fn from(request: BackfillRequest) -> Self {
        Self::Request(request)
    }
}

impl From<BackfillCancel> for BackfillerMessage {
    fn from(cancel: BackfillCancel) -> Self {
        Self::Cancel(cancel)
    }
}
