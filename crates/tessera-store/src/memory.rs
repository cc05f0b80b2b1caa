//! In-memory [`StoreView`] implementation.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tessera_region::{Region, RightBound, Shardable, is_superset};
use tessera_types::{Key, Version, VersionRange};

use crate::{
    BackfillAtom, BackfillChunk, ChunkPayload, ReadQuery, ReadResponse, ReadTransaction,
    Result, StoreError, StoreView, VersionMap, WriteQuery, WriteTransaction,
};

/// One key's stored state. Deletions are kept as tombstones so they can be
/// transferred by incremental backfills.
#[derive(Debug, Clone)]
struct StoredValue {
    value: Option<Bytes>,
    recency: Version,
}

#[derive(Debug)]
struct MemoryState {
    data: BTreeMap<Key, StoredValue>,
    metadata: VersionMap,
}

/// A store that keeps every key and its version metadata in memory.
///
/// Transactions hold the store lock for their whole lifetime, so every read
/// sees one snapshot and write transactions are serialised.
#[derive(Debug)]
pub struct MemoryStore {
    region: Region,
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Creates an empty store for `region`; its metadata starts at zero.
    pub fn new(region: Region) -> Self {
        Self {
            region,
            state: Mutex::new(MemoryState {
                data: BTreeMap::new(),
                metadata: VersionMap::new(region, VersionRange::zero()),
            }),
        }
    }

    /// Number of live (non-tombstone) keys held.
    pub fn live_key_count(&self) -> usize {
        self.lock().data.values().filter(|v| v.value.is_some()).count()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A panicking writer never commits partial state, so the data is intact.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_range(&self, requested: &Region) -> Result<()> {
        if is_superset(&self.region, requested) {
            Ok(())
        } else {
            Err(StoreError::OutOfRange {
                requested: *requested,
                store: self.region,
            })
        }
    }
}

impl StoreView for MemoryStore {
    fn region(&self) -> Region {
        self.region
    }

    fn begin_read(&self) -> Box<dyn ReadTransaction + '_> {
        Box::new(MemoryRead {
            store: self,
            state: self.lock(),
        })
    }

    fn begin_write(&self) -> Box<dyn WriteTransaction + '_> {
        Box::new(MemoryWrite {
            store: self,
            state: self.lock(),
            staged: Vec::new(),
        })
    }
}

fn keys_in<'a>(
    data: &'a BTreeMap<Key, StoredValue>,
    region: &Region,
) -> Box<dyn Iterator<Item = (&'a Key, &'a StoredValue)> + 'a> {
    if region.is_empty() {
        return Box::new(std::iter::empty());
    }
    match region.end() {
        RightBound::Key(end) => Box::new(data.range(region.start()..end)),
        RightBound::Unbounded => Box::new(data.range(region.start()..)),
    }
}

// ============================================================================
// Read Transactions
// ============================================================================

struct MemoryRead<'a> {
    store: &'a MemoryStore,
    state: MutexGuard<'a, MemoryState>,
}

impl ReadTransaction for MemoryRead<'_> {
    fn get_metadata(&self, region: &Region) -> Result<VersionMap> {
        self.store.check_range(region)?;
        Ok(self.state.metadata.mask(region))
    }

    fn read(&self, query: &ReadQuery) -> Result<ReadResponse> {
        let region = query.region();
        self.store.check_range(&region)?;

        let entries = keys_in(&self.state.data, &region)
            .filter_map(|(k, v)| v.value.clone().map(|value| (*k, value)))
            .collect();
        Ok(ReadResponse { entries })
    }

    fn backfill_chunks(
        &self,
        since: &VersionMap,
        chunk_size: usize,
    ) -> Result<Vec<BackfillChunk>> {
        self.store.check_range(&since.domain())?;
        let chunk_size = chunk_size.max(1);

        // Per sub-region: resume from `since.earliest` where the copy is an
        // earlier point of this snapshot's history, otherwise resend in full.
        let plan = since.zip(&self.state.metadata.mask(&since.domain()), |copy, source| {
            source.continues_from(copy).then_some(copy.earliest())
        })?;

        let mut chunks = Vec::new();
        for (region, resume) in plan.iter() {
            if resume.is_none() {
                chunks.push(BackfillChunk::delete_range(*region));
            }

            let atoms: Vec<BackfillAtom> = keys_in(&self.state.data, region)
                .filter(|(_, stored)| match resume {
                    Some(earliest) => stored.recency > *earliest,
                    None => stored.value.is_some(),
                })
                .map(|(key, stored)| BackfillAtom {
                    key: *key,
                    value: stored.value.clone(),
                    recency: stored.recency,
                })
                .collect();

            for batch in atoms.chunks(chunk_size) {
                chunks.push(BackfillChunk::key_values(batch.to_vec())?);
            }
        }

        tracing::trace!(
            domain = %since.domain(),
            chunks = chunks.len(),
            "generated backfill chunks"
        );
        Ok(chunks)
    }
}

// ============================================================================
// Write Transactions
// ============================================================================

enum Staged {
    Metadata(VersionMap),
    Chunk(BackfillChunk),
    Write(WriteQuery, Version),
    Erase(Region),
}

struct MemoryWrite<'a> {
    store: &'a MemoryStore,
    state: MutexGuard<'a, MemoryState>,
    staged: Vec<Staged>,
}

impl WriteTransaction for MemoryWrite<'_> {
    fn get_metadata(&self, region: &Region) -> Result<VersionMap> {
        self.store.check_range(region)?;
        Ok(self.state.metadata.mask(region))
    }

    fn set_metadata(&mut self, metadata: VersionMap) -> Result<()> {
        self.store.check_range(&metadata.domain())?;
        self.staged.push(Staged::Metadata(metadata));
        Ok(())
    }

    fn receive_backfill(&mut self, chunk: &BackfillChunk) -> Result<()> {
        self.store.check_range(&chunk.region)?;
        self.staged.push(Staged::Chunk(chunk.clone()));
        Ok(())
    }

    fn write(&mut self, query: &WriteQuery, version: Version) -> Result<()> {
        self.store.check_range(&query.region())?;
        self.staged.push(Staged::Write(query.clone(), version));
        Ok(())
    }

    fn erase(&mut self, region: &Region) -> Result<()> {
        self.store.check_range(region)?;
        self.staged.push(Staged::Erase(*region));
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        let staged = std::mem::take(&mut self.staged);
        let state = &mut *self.state;

        for op in staged {
            match op {
                Staged::Metadata(metadata) => state.metadata.update(metadata)?,
                Staged::Chunk(chunk) => apply_chunk(&mut state.data, chunk),
                Staged::Write(query, version) => {
                    for (key, value) in query.mutations() {
                        state.data.insert(
                            *key,
                            StoredValue {
                                value: value.clone(),
                                recency: version,
                            },
                        );
                    }
                }
                Staged::Erase(region) => {
                    remove_range(&mut state.data, &region);
                    state.metadata.set(region, VersionRange::zero())?;
                }
            }
        }
        Ok(())
    }
}

fn apply_chunk(data: &mut BTreeMap<Key, StoredValue>, chunk: BackfillChunk) {
    match chunk.payload {
        ChunkPayload::DeleteRange => remove_range(data, &chunk.region),
        ChunkPayload::KeyValues(atoms) => {
            for atom in atoms {
                data.insert(
                    atom.key,
                    StoredValue {
                        value: atom.value,
                        recency: atom.recency,
                    },
                );
            }
        }
    }
}

fn remove_range(data: &mut BTreeMap<Key, StoredValue>, region: &Region) {
    let doomed: Vec<Key> = keys_in(data, region).map(|(k, _)| *k).collect();
    for key in doomed {
        data.remove(&key);
    }
}
