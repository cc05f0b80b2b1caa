//! tessera-wire: Peer mailboxes and message payloads for `Tessera`
//!
//! Peers talk only by message passing. Every mailbox is a bounded
//! `tokio::sync::mpsc` channel; an [`Endpoint`] is the sending half tagged
//! with the peer that owns the receiver. Endpoints are cheap to clone and are
//! published in the directory so remote peers can reach a shard's services.
//!
//! Payloads are grouped by protocol:
//!
//! - [`backfill`]: request / endpoint / chunk / done / cancel
//! - [`broadcast`]: primary write path and listener subscriptions
//!
//! Only payload shapes live here; byte encoding belongs to whatever transport
//! carries them between processes.

use std::fmt::Debug;

use tessera_types::PeerId;
use tokio::sync::mpsc;

pub mod backfill;
pub mod broadcast;

pub use backfill::{
    BackfillCancel, BackfillDone, BackfillEndpoint, BackfillRequest, BackfillerMessage,
};
pub use broadcast::{BroadcastMessage, StreamedWrite, Subscription};

// ============================================================================
// Endpoints
// ============================================================================

/// The sending half of a peer's mailbox.
///
/// Two endpoints compare equal when they feed the same mailbox.
pub struct Endpoint<T> {
    peer: PeerId,
    tx: mpsc::Sender<T>,
}

impl<T> Endpoint<T> {
    /// Creates a mailbox owned by `peer`, returning its endpoint and receiver.
    pub fn channel(peer: PeerId, capacity: usize) -> (Self, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { peer, tx }, rx)
    }

    /// The peer that owns the receiving half.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Sends `msg`, waiting for mailbox capacity.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Closed`] if the receiver is gone.
    pub async fn send(&self, msg: T) -> Result<(), WireError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| WireError::Closed { peer: self.peer })
    }

    /// Sends `msg` without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Full`] if the mailbox has no capacity, or
    /// [`WireError::Closed`] if the receiver is gone.
    pub fn try_send(&self, msg: T) -> Result<(), WireError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => WireError::Full { peer: self.peer },
            mpsc::error::TrySendError::Closed(_) => WireError::Closed { peer: self.peer },
        })
    }

    /// Returns true once the receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Completes when the receiver is dropped.
    ///
    /// This is how a caller notices that the owning peer (or session) is gone.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }
}

impl<T> Clone for Endpoint<T> {
    fn clone(&self) -> Self {
        Self {
            peer: self.peer,
            tx: self.tx.clone(),
        }
    }
}

impl<T> PartialEq for Endpoint<T> {
    fn eq(&self, other: &Self) -> bool {
        self.peer == other.peer && self.tx.same_channel(&other.tx)
    }
}

impl<T> Eq for Endpoint<T> {}

impl<T> Debug for Endpoint<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("peer", &self.peer)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from sending to an [`Endpoint`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// The receiving side has been dropped.
    #[error("mailbox of {peer} is closed")]
    Closed { peer: PeerId },

    /// The mailbox is at capacity.
    #[error("mailbox of {peer} is full")]
    Full { peer: PeerId },
}
