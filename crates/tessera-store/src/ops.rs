//! Region-scoped operations: reads, writes, and backfill chunks.
//!
//! Every operation carries the region it touches and implements
//! [`Shardable`] so it can be split across owners.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tessera_region::{JoinError, Region, RegionError, Shardable, intersection};
use tessera_types::{Key, Version};

// ============================================================================
// Reads
// ============================================================================

/// Reads every live key in a region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadQuery {
    region: Region,
}

impl ReadQuery {
    pub fn new(region: Region) -> Self {
        Self { region }
    }

    /// Reads a single key.
    pub fn get(key: Key) -> Self {
        Self::new(Region::point(key))
    }
}

impl Shardable for ReadQuery {
    fn region(&self) -> Region {
        self.region
    }

    fn restrict(&self, region: &Region) -> Self {
        Self::new(intersection(&self.region, region))
    }
}

/// Result of a [`ReadQuery`]: the live key/value pairs in the region.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadResponse {
    pub entries: BTreeMap<Key, Bytes>,
}

impl ReadResponse {
    pub fn get(&self, key: Key) -> Option<&Bytes> {
        self.entries.get(&key)
    }
}

// ============================================================================
// Writes
// ============================================================================

/// A batch of mutations; `None` deletes the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteQuery {
    region: Region,
    mutations: BTreeMap<Key, Option<Bytes>>,
}

impl WriteQuery {
    /// Creates a write over `region`.
    ///
    /// # Errors
    ///
    /// Returns [`RegionError::NotSubset`] if a mutated key lies outside
    /// `region`.
    pub fn new(
        region: Region,
        mutations: BTreeMap<Key, Option<Bytes>>,
    ) -> Result<Self, RegionError> {
        if let Some(&key) = mutations.keys().find(|k| !region.contains(**k)) {
            return Err(RegionError::NotSubset {
                inner: Region::point(key),
                outer: region,
            });
        }
        Ok(Self { region, mutations })
    }

    /// Writes `value` at `key`.
    pub fn set(key: Key, value: impl Into<Bytes>) -> Self {
        Self {
            region: Region::point(key),
            mutations: BTreeMap::from([(key, Some(value.into()))]),
        }
    }

    /// Deletes `key`.
    pub fn delete(key: Key) -> Self {
        Self {
            region: Region::point(key),
            mutations: BTreeMap::from([(key, None)]),
        }
    }

    pub fn mutations(&self) -> &BTreeMap<Key, Option<Bytes>> {
        &self.mutations
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

impl Shardable for WriteQuery {
    fn region(&self) -> Region {
        self.region
    }

    fn restrict(&self, region: &Region) -> Self {
        Self {
            region: intersection(&self.region, region),
            mutations: self
                .mutations
                .iter()
                .filter(|(k, _)| region.contains(**k))
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
        }
    }
}

// ============================================================================
// Backfill Chunks
// ============================================================================

/// One key's state as transferred by a backfill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillAtom {
    pub key: Key,
    /// `None` transfers a deletion.
    pub value: Option<Bytes>,
    /// Version of the write that produced this state.
    pub recency: Version,
}

/// What a chunk does to the destination store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkPayload {
    /// Clear every key in the chunk's region.
    DeleteRange,
    /// Overwrite the listed keys.
    KeyValues(Vec<BackfillAtom>),
}

/// A unit of backfill transfer, tagged with the region it affects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillChunk {
    pub region: Region,
    pub payload: ChunkPayload,
}

impl BackfillChunk {
    pub fn delete_range(region: Region) -> Self {
        Self {
            region,
            payload: ChunkPayload::DeleteRange,
        }
    }

    /// Builds a key/value chunk whose region spans exactly its atoms.
    ///
    /// # Errors
    ///
    /// Returns [`RegionError::Join`] if two atoms share a key.
    pub fn key_values(atoms: Vec<BackfillAtom>) -> Result<Self, RegionError> {
        let mut keys: Vec<Key> = atoms.iter().map(|a| a.key).collect();
        keys.sort_unstable();
        if let Some(pair) = keys.windows(2).find(|w| w[0] == w[1]) {
            return Err(JoinError::Overlap(Region::point(pair[0]), Region::point(pair[1])).into());
        }

        let region = match (keys.first(), keys.last()) {
            (Some(&first), Some(&last)) => Region::new(first, Region::point(last).end()),
            _ => Region::empty(),
        };
        Ok(Self {
            region,
            payload: ChunkPayload::KeyValues(atoms),
        })
    }

    /// Number of atoms carried (zero for range deletions).
    pub fn atom_count(&self) -> usize {
        match &self.payload {
            ChunkPayload::DeleteRange => 0,
            ChunkPayload::KeyValues(atoms) => atoms.len(),
        }
    }
}

impl Shardable for BackfillChunk {
    fn region(&self) -> Region {
        self.region
    }

    fn restrict(&self, region: &Region) -> Self {
        let payload = match &self.payload {
            ChunkPayload::DeleteRange => ChunkPayload::DeleteRange,
            ChunkPayload::KeyValues(atoms) => ChunkPayload::KeyValues(
                atoms
                    .iter()
                    .filter(|a| region.contains(a.key))
                    .cloned()
                    .collect(),
            ),
        };
        Self {
            region: intersection(&self.region, region),
            payload,
        }
    }
}
