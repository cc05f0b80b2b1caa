//! tessera-store: The store view contract for `Tessera`
//!
//! The replication core never touches the physical storage engine directly.
//! It talks to a [`StoreView`], which hands out transactions:
//!
//! - [`ReadTransaction`]: version metadata, reads, and backfill chunk
//!   generation from one consistent snapshot
//! - [`WriteTransaction`]: metadata updates, backfill chunk application, and
//!   replicated writes, applied atomically on [`commit`](WriteTransaction::commit)
//!
//! The store owns the per-region version metadata (a
//! `RegionMap<VersionRange>`), and only mutates it inside a write transaction.
//! Write transactions are serialised by the store; callers never assume
//! interleaving is safe.
//!
//! [`MemoryStore`] is the in-process reference implementation used by the
//! reactor tests and the local cluster harness.

use tessera_region::{Region, RegionError, RegionMap};
use tessera_types::{Version, VersionRange};

mod memory;
mod ops;

pub use memory::MemoryStore;
pub use ops::{BackfillAtom, BackfillChunk, ChunkPayload, ReadQuery, ReadResponse, WriteQuery};

/// Version metadata for a region: what version of the data each sub-region holds.
pub type VersionMap = RegionMap<VersionRange>;

/// A view onto the part of a storage engine that holds one namespace.
pub trait StoreView: Send + Sync + 'static {
    /// The region of the keyspace this store can hold.
    fn region(&self) -> Region;

    /// Opens a read transaction over a consistent snapshot.
    fn begin_read(&self) -> Box<dyn ReadTransaction + '_>;

    /// Opens a write transaction. The store admits one at a time.
    fn begin_write(&self) -> Box<dyn WriteTransaction + '_>;
}

/// A read-only view of one consistent store snapshot.
pub trait ReadTransaction {
    /// Returns the version metadata restricted to `region`.
    fn get_metadata(&self, region: &Region) -> Result<VersionMap>;

    /// Reads every live key in the query's region.
    fn read(&self, query: &ReadQuery) -> Result<ReadResponse>;

    /// Produces the ordered chunks that bring a store described by `since`
    /// up to this snapshot.
    ///
    /// Where this snapshot [continues from](VersionRange::continues_from)
    /// `since`, only keys written after `since.earliest` are sent. Every other
    /// sub-region (never written, ahead of this snapshot, or on another
    /// branch) is cleared with a `DeleteRange` chunk and resent in full. Each
    /// key/value chunk carries at most `chunk_size` atoms.
    fn backfill_chunks(&self, since: &VersionMap, chunk_size: usize)
    -> Result<Vec<BackfillChunk>>;
}

/// A batch of mutations applied atomically on commit.
///
/// Dropping a transaction without committing discards it.
pub trait WriteTransaction {
    /// Returns the committed version metadata restricted to `region`.
    fn get_metadata(&self, region: &Region) -> Result<VersionMap>;

    /// Overwrites the metadata for the sub-region covered by `metadata`.
    fn set_metadata(&mut self, metadata: VersionMap) -> Result<()>;

    /// Applies one backfill chunk.
    fn receive_backfill(&mut self, chunk: &BackfillChunk) -> Result<()>;

    /// Applies a replicated write produced at `version`.
    fn write(&mut self, query: &WriteQuery, version: Version) -> Result<()>;

    /// Drops all data in `region` and resets its metadata to "never written".
    fn erase(&mut self, region: &Region) -> Result<()>;

    /// Applies every staged mutation.
    fn commit(self: Box<Self>) -> Result<()>;
}

/// Errors reported by a store.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The operation reaches outside the region this store holds.
    #[error("{requested} is outside the store region {store}")]
    OutOfRange { requested: Region, store: Region },

    /// Region arithmetic on the operation failed.
    #[error(transparent)]
    Region(#[from] RegionError),

    /// A write would need a version past the last representable one.
    #[error("version space exhausted after {0}")]
    VersionExhausted(Version),

    /// The storage engine could not complete the operation.
    #[error("storage engine unavailable: {0}")]
    Unavailable(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Returns the newest `latest` version recorded anywhere in `metadata`.
pub fn max_version(metadata: &VersionMap) -> Version {
    metadata
        .values()
        .map(VersionRange::latest)
        .max()
        .unwrap_or(Version::ZERO)
}
