//! Primary write path and write-stream subscriptions.

use tessera_store::{ReadQuery, ReadResponse, StoreError, WriteQuery};
use tessera_types::{BranchId, Version};
use tokio::sync::oneshot;

use crate::Endpoint;

/// Everything a primary's broadcast mailbox accepts.
#[derive(Debug)]
pub enum BroadcastMessage {
    /// Apply a write at the next version and stream it to listeners.
    Write {
        query: WriteQuery,
        resp: oneshot::Sender<Result<Version, StoreError>>,
    },
    /// Register a listener for every write after the reply's version.
    Subscribe {
        listener: Endpoint<StreamedWrite>,
        resp: oneshot::Sender<Subscription>,
    },
    /// Serve a read from the primary's store.
    Read {
        query: ReadQuery,
        resp: oneshot::Sender<Result<ReadResponse, StoreError>>,
    },
}

/// Reply to [`BroadcastMessage::Subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub branch_id: BranchId,
    /// The listener receives every write strictly after this version.
    pub version: Version,
}

/// A write as forwarded from a primary to its listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamedWrite {
    pub version: Version,
    pub query: WriteQuery,
}
