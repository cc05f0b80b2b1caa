//! # tessera-types: Core types for `Tessera`
//!
//! This crate contains shared types used across the `Tessera` system:
//! - Entity IDs ([`PeerId`], [`BranchId`], [`SessionId`], [`Namespace`])
//! - Keyspace positions ([`Key`])
//! - Data versions ([`Version`], [`VersionRange`])

use std::fmt::{Debug, Display};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Position of a key in the keyspace.
///
/// Keys are hashed or range-partitioned into `u64` positions by the layer
/// above this core; regions are half-open ranges over these positions.
pub type Key = u64;

// ============================================================================
// Entity IDs - All Copy (cheap values)
// ============================================================================

/// Unique identifier for a peer in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(u64);

impl PeerId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

impl From<u64> for PeerId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<PeerId> for u64 {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

/// Identifies one epoch of primary ownership over a region.
///
/// A fresh branch is created every time a peer starts serving as primary,
/// so writes from a stale primary can be told apart from the current one.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BranchId(Uuid);

impl BranchId {
    /// Generates a new random branch id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Debug for BranchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BranchId({})", self.0)
    }
}

impl Display for BranchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one backfill attempt.
///
/// Generated by the requesting side; the source tracks its half of the
/// session under the same id so either side can cancel it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generates a fresh, unique session id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Debug for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of an independently replicated keyspace (a table or bucket).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Namespace(String);

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Namespace {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Namespace {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// Versions
// ============================================================================

/// A totally ordered marker for the state of a region's data.
///
/// `Version::ZERO` means the region has never held any data.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Version(u64);

impl Version {
    pub const ZERO: Version = Version(0);

    pub fn new(timestamp: u64) -> Self {
        Self(timestamp)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the version that follows this one, or `None` once the
    /// version space is exhausted.
    pub fn checked_next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Version> for u64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// The known bounds on the version of one region's data, and the branch
/// whose history that data follows.
///
/// When `earliest == latest` the state is known precisely. A wider range
/// marks data that is somewhere in between, which is how an in-flight
/// backfill is advertised to concurrent readers.
///
/// Data that never passed through a primary (seeded directly into a store)
/// carries no branch. Versions are only comparable along one branch: two
/// copies at the same version on different branches may hold different keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionRange {
    earliest: Version,
    latest: Version,
    #[serde(default)]
    branch: Option<BranchId>,
}

impl VersionRange {
    /// Creates an unbranched range, returning `None` if `earliest > latest`.
    pub fn new(earliest: Version, latest: Version) -> Option<Self> {
        (earliest <= latest).then_some(Self {
            earliest,
            latest,
            branch: None,
        })
    }

    /// An unbranched range that pins the data to exactly one version.
    pub fn precise(version: Version) -> Self {
        Self {
            earliest: version,
            latest: version,
            branch: None,
        }
    }

    /// Data written by `branch`'s primary, up to and including `version`.
    pub fn on_branch(branch: BranchId, version: Version) -> Self {
        Self::precise(version).with_branch(Some(branch))
    }

    /// The range of a region that has never held data.
    pub fn zero() -> Self {
        Self::precise(Version::ZERO)
    }

    pub fn earliest(&self) -> Version {
        self.earliest
    }

    pub fn latest(&self) -> Version {
        self.latest
    }

    pub fn branch(&self) -> Option<BranchId> {
        self.branch
    }

    #[must_use]
    pub fn with_branch(mut self, branch: Option<BranchId>) -> Self {
        self.branch = branch;
        self
    }

    /// Returns true if the data state is known precisely.
    pub fn is_coherent(&self) -> bool {
        self.earliest == self.latest
    }

    /// Returns true if `since` is an earlier point of the same history as
    /// `self`: same branch, no newer, and holding data. Only then can a copy
    /// at `since` be brought to `self` by the keys written after
    /// `since.earliest()`; anything else needs a full resend.
    pub fn continues_from(&self, since: &VersionRange) -> bool {
        since.earliest > Version::ZERO && since.branch == self.branch && since.latest <= self.latest
    }

    /// The in-flight range of a copy being rebuilt from nothing toward `self`.
    #[must_use]
    pub fn from_scratch(&self) -> Self {
        Self {
            earliest: Version::ZERO,
            ..*self
        }
    }

    /// Widens from this range's `earliest` to `other`'s `latest`, on
    /// `other`'s branch.
    ///
    /// Used to mark a region as "in flight" between a start and an end state.
    /// Returns `None` if `other.latest` precedes `self.earliest`.
    pub fn widen_to(&self, other: &VersionRange) -> Option<Self> {
        Self::new(self.earliest, other.latest).map(|range| range.with_branch(other.branch))
    }
}

impl Default for VersionRange {
    fn default() -> Self {
        Self::zero()
    }
}

impl Display for VersionRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_coherent() {
            write!(f, "{}", self.earliest)?;
        } else {
            write!(f, "{}..={}", self.earliest, self.latest)?;
        }
        match self.branch {
            Some(branch) => write!(f, "@{branch}"),
            None => Ok(()),
        }
    }
}
