//! tessera-region: Region algebra for `Tessera`
//!
//! A [`Region`] is a half-open range of keyspace positions. Regions are the
//! unit of ownership: the blueprint assigns them to peers, the reactor runs
//! one activity per region, and the backfill protocol transfers them.
//!
//! Everything here is pure and deterministic. Peers compare the results of
//! these functions with each other, so the same inputs must always produce
//! bit-for-bit identical outputs.
//!
//! # Operations
//!
//! - [`is_superset`]: every key of `b` is in `a`
//! - [`intersection`]: the largest region inside both operands
//! - [`join`]: union of pairwise-disjoint regions (fails on overlap or gaps)
//! - [`subtract`]: the pieces of `a` not covered by `b`
//! - [`shard`]: restrict a region-scoped operation to a sub-region
//!
//! # Example
//!
//! ```
//! use tessera_region::{Region, intersection, is_superset, join};
//!
//! let left = Region::range(0, 50);
//! let right = Region::range(50, 100);
//!
//! assert_eq!(join(&[left, right]).unwrap(), Region::range(0, 100));
//! assert!(intersection(&left, &right).is_empty());
//! assert!(is_superset(&Region::universe(), &left));
//! ```

use std::cmp::Ordering;
use std::fmt::Display;
use std::ops::Range;

use serde::{Deserialize, Serialize};
use tessera_types::Key;

mod map;
mod shard;

pub use map::RegionMap;
pub use shard::{Shardable, shard};

// ============================================================================
// Region
// ============================================================================

/// Exclusive upper bound of a region.
///
/// Variant order matters: every `Key(_)` sorts before `Unbounded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RightBound {
    /// Keys strictly below this position.
    Key(Key),
    /// Every key from the start onward.
    Unbounded,
}

impl RightBound {
    fn admits(self, key: Key) -> bool {
        match self {
            RightBound::Key(end) => key < end,
            RightBound::Unbounded => true,
        }
    }
}

impl Display for RightBound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RightBound::Key(key) => write!(f, "{key}"),
            RightBound::Unbounded => write!(f, "+inf"),
        }
    }
}

/// A subset of the keyspace: the half-open range `[start, end)`.
///
/// Constructors normalise every empty range to [`Region::empty()`], so two
/// empty regions always compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    start: Key,
    end: RightBound,
}

impl Region {
    const EMPTY: Region = Region {
        start: 0,
        end: RightBound::Key(0),
    };

    /// Creates `[start, end)`, normalising empty ranges.
    pub fn new(start: Key, end: RightBound) -> Self {
        let region = Self { start, end };
        if region.is_empty() { Self::EMPTY } else { region }
    }

    /// Creates the bounded range `[start, end)`.
    pub fn range(start: Key, end: Key) -> Self {
        Self::new(start, RightBound::Key(end))
    }

    /// Creates the unbounded range `[start, +inf)`.
    pub fn from_start(start: Key) -> Self {
        Self::new(start, RightBound::Unbounded)
    }

    /// The region containing a single key.
    pub fn point(key: Key) -> Self {
        match key.checked_add(1) {
            Some(end) => Self::range(key, end),
            None => Self::from_start(key),
        }
    }

    /// The region containing no keys.
    pub fn empty() -> Self {
        Self::EMPTY
    }

    /// The region containing every key.
    pub fn universe() -> Self {
        Self::from_start(0)
    }

    pub fn start(&self) -> Key {
        self.start
    }

    pub fn end(&self) -> RightBound {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        !self.end.admits(self.start)
    }

    pub fn contains(&self, key: Key) -> bool {
        key >= self.start && self.end.admits(key)
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        !intersection(self, other).is_empty()
    }

    /// Returns true if `other` begins exactly where `self` ends.
    pub fn abuts(&self, other: &Region) -> bool {
        !self.is_empty() && !other.is_empty() && self.end == RightBound::Key(other.start)
    }
}

impl Default for Region {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl From<Range<Key>> for Region {
    fn from(range: Range<Key>) -> Self {
        Self::range(range.start, range.end)
    }
}

impl PartialOrd for Region {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Region {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start
            .cmp(&other.start)
            .then_with(|| self.end.cmp(&other.end))
    }
}

impl Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            write!(f, "[empty)")
        } else {
            write!(f, "[{}, {})", self.start, self.end)
        }
    }
}

// ============================================================================
// Algebra
// ============================================================================

/// Returns true iff every key in `b` is also in `a`.
pub fn is_superset(a: &Region, b: &Region) -> bool {
    b.is_empty() || (a.start <= b.start && a.end >= b.end)
}

/// Returns the largest region contained in both `a` and `b`.
///
/// Always succeeds; disjoint operands yield [`Region::empty()`].
pub fn intersection(a: &Region, b: &Region) -> Region {
    Region::new(a.start.max(b.start), a.end.min(b.end))
}

/// Returns the union of `regions`.
///
/// Empty inputs are ignored; joining nothing yields [`Region::empty()`].
///
/// # Errors
///
/// - [`JoinError::Overlap`] if two inputs share a key
/// - [`JoinError::NotRepresentable`] if the union has a gap
pub fn join(regions: &[Region]) -> Result<Region, JoinError> {
    let mut sorted: Vec<Region> = regions.iter().copied().filter(|r| !r.is_empty()).collect();
    sorted.sort();

    let Some(first) = sorted.first().copied() else {
        return Ok(Region::empty());
    };

    let mut end = first.end;
    for pair in sorted.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        match RightBound::Key(next.start).cmp(&prev.end) {
            Ordering::Less => return Err(JoinError::Overlap(prev, next)),
            Ordering::Greater => return Err(JoinError::NotRepresentable(prev, next)),
            Ordering::Equal => end = next.end,
        }
    }

    Ok(Region::new(first.start, end))
}

/// Returns the parts of `a` not covered by `b`, in key order.
///
/// Yields zero, one, or two non-empty pieces.
pub fn subtract(a: &Region, b: &Region) -> Vec<Region> {
    if !a.overlaps(b) {
        return if a.is_empty() { Vec::new() } else { vec![*a] };
    }

    let mut pieces = Vec::with_capacity(2);
    let left = Region::range(a.start, b.start);
    if !left.is_empty() {
        pieces.push(left);
    }
    if let RightBound::Key(b_end) = b.end {
        let right = Region::new(b_end, a.end);
        if !right.is_empty() {
            pieces.push(right);
        }
    }
    pieces
}

/// Returns the parts of `region` not covered by any of `covered`, in key order.
pub fn subtract_all<'a>(region: &Region, covered: impl IntoIterator<Item = &'a Region>) -> Vec<Region> {
    let mut remaining = vec![*region];
    for hole in covered {
        remaining = remaining
            .iter()
            .flat_map(|piece| subtract(piece, hole))
            .collect();
        if remaining.is_empty() {
            break;
        }
    }
    remaining
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from [`join`].
///
/// Both conditions can hold at once; the first one found in key order is
/// reported.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    /// Two inputs share at least one key.
    #[error("regions overlap: {0} and {1}")]
    Overlap(Region, Region),

    /// The union cannot be expressed as a single region.
    #[error("union is not a single region: gap between {0} and {1}")]
    NotRepresentable(Region, Region),
}

/// Errors from region arithmetic on operations and region maps.
///
/// These always indicate a malformed blueprint or a bug; they are never
/// silently recovered.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegionError {
    /// A set of regions could not be joined.
    #[error(transparent)]
    Join(#[from] JoinError),

    /// A region was required to lie inside another and does not.
    #[error("{inner} is not a subset of {outer}")]
    NotSubset { inner: Region, outer: Region },

    /// Two region maps were combined over different domains.
    #[error("region map domains differ: {left} vs {right}")]
    DomainMismatch { left: Region, right: Region },
}
