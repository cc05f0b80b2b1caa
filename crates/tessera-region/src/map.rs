//! Ordered, non-overlapping maps from regions to values.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use tessera_types::Key;

use crate::{Region, RegionError, intersection, is_superset, join, subtract};

/// An ordered list of `(Region, T)` entries covering a declared domain.
///
/// **Invariants:**
/// 1. Entry regions are non-empty and pairwise disjoint
/// 2. Entries are sorted by region start
/// 3. The union of entry regions equals [`domain`](Self::domain)
///
/// So for any key in the domain exactly one entry contains it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionMap<T> {
    domain: Region,
    entries: Vec<(Region, T)>,
}

impl<T> RegionMap<T> {
    /// Creates a map assigning `value` to the whole of `domain`.
    pub fn new(domain: Region, value: T) -> Self {
        let entries = if domain.is_empty() {
            Vec::new()
        } else {
            vec![(domain, value)]
        };
        Self { domain, entries }
    }

    /// Builds a map from entries, deriving the domain by joining their regions.
    ///
    /// Empty regions are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`RegionError::Join`] if the regions overlap or leave a gap.
    pub fn from_parts(parts: impl IntoIterator<Item = (Region, T)>) -> Result<Self, RegionError> {
        let mut entries: Vec<(Region, T)> =
            parts.into_iter().filter(|(r, _)| !r.is_empty()).collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));

        let regions: Vec<Region> = entries.iter().map(|(r, _)| *r).collect();
        let domain = join(&regions)?;

        Ok(Self { domain, entries })
    }

    pub fn domain(&self) -> Region {
        self.domain
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Region, &T)> {
        self.entries.iter().map(|(r, v)| (r, v))
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|(_, v)| v)
    }

    /// Returns the value for the entry containing `key`.
    pub fn lookup(&self, key: Key) -> Option<&T> {
        let idx = self.entries.partition_point(|(r, _)| r.start() <= key);
        let (region, value) = self.entries.get(idx.checked_sub(1)?)?;
        region.contains(key).then_some(value)
    }

    /// Applies `f` to every value, keeping the region layout.
    pub fn map<U>(&self, mut f: impl FnMut(&Region, &T) -> U) -> RegionMap<U> {
        RegionMap {
            domain: self.domain,
            entries: self.entries.iter().map(|(r, v)| (*r, f(r, v))).collect(),
        }
    }

    /// Pairwise intersection of two maps over the same domain.
    ///
    /// The result has one entry for every pair of overlapping entries, in key
    /// order, holding `f(left, right)`. Because both inputs partition the same
    /// domain, the pairwise intersections partition it too, whatever the
    /// alignment of their boundaries.
    ///
    /// # Errors
    ///
    /// Returns [`RegionError::DomainMismatch`] if the domains differ.
    pub fn zip<U, V>(
        &self,
        other: &RegionMap<U>,
        mut f: impl FnMut(&T, &U) -> V,
    ) -> Result<RegionMap<V>, RegionError> {
        if self.domain != other.domain {
            return Err(RegionError::DomainMismatch {
                left: self.domain,
                right: other.domain,
            });
        }

        let mut entries = Vec::with_capacity(self.entries.len() + other.entries.len());
        let (mut i, mut j) = (0, 0);
        while i < self.entries.len() && j < other.entries.len() {
            let (left_region, left) = &self.entries[i];
            let (right_region, right) = &other.entries[j];

            let overlap = intersection(left_region, right_region);
            if !overlap.is_empty() {
                entries.push((overlap, f(left, right)));
            }

            match left_region.end().cmp(&right_region.end()) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    i += 1;
                    j += 1;
                }
            }
        }

        Ok(RegionMap {
            domain: self.domain,
            entries,
        })
    }
}

impl<T: Clone> RegionMap<T> {
    /// Restricts the map to `region`.
    ///
    /// The resulting domain is the intersection of the current domain and
    /// `region`.
    pub fn mask(&self, region: &Region) -> Self {
        let entries = self
            .entries
            .iter()
            .filter_map(|(r, v)| {
                let overlap = intersection(r, region);
                (!overlap.is_empty()).then(|| (overlap, v.clone()))
            })
            .collect();

        Self {
            domain: intersection(&self.domain, region),
            entries,
        }
    }

    /// Overwrites the part of this map covered by `other`'s domain.
    ///
    /// # Errors
    ///
    /// Returns [`RegionError::NotSubset`] if `other` reaches outside this
    /// map's domain.
    pub fn update(&mut self, other: RegionMap<T>) -> Result<(), RegionError> {
        if !is_superset(&self.domain, &other.domain) {
            return Err(RegionError::NotSubset {
                inner: other.domain,
                outer: self.domain,
            });
        }

        let mut entries: Vec<(Region, T)> = self
            .entries
            .iter()
            .flat_map(|(r, v)| {
                subtract(r, &other.domain)
                    .into_iter()
                    .map(move |piece| (piece, v.clone()))
            })
            .collect();
        entries.extend(other.entries);
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));

        self.entries = entries;
        Ok(())
    }

    /// Sets every key of `region` to `value`.
    pub fn set(&mut self, region: Region, value: T) -> Result<(), RegionError> {
        self.update(RegionMap::new(region, value))
    }
}

impl<T: Clone + PartialEq> RegionMap<T> {
    /// Merges adjacent entries holding equal values.
    ///
    /// The result is the canonical form of the map: two maps that assign the
    /// same value to every key coalesce to identical entry lists.
    pub fn coalesce(&self) -> Self {
        let mut entries: Vec<(Region, T)> = Vec::with_capacity(self.entries.len());
        for (region, value) in &self.entries {
            if let Some((last_region, last_value)) = entries.last_mut() {
                if last_region.abuts(region) && last_value == value {
                    *last_region = Region::new(last_region.start(), region.end());
                    continue;
                }
            }
            entries.push((*region, value.clone()));
        }

        Self {
            domain: self.domain,
            entries,
        }
    }

    /// Returns the single value covering the whole domain, if there is one.
    pub fn uniform_value(&self) -> Option<&T> {
        let first = self.entries.first().map(|(_, v)| v)?;
        self.values().all(|v| v == first).then_some(first)
    }
}

impl<T> IntoIterator for RegionMap<T> {
    type Item = (Region, T);
    type IntoIter = std::vec::IntoIter<(Region, T)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<T: Display> Display for RegionMap<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (idx, (region, value)) in self.entries.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{region}: {value}")?;
        }
        write!(f, "}}")
    }
}

impl<T> Default for RegionMap<T> {
    fn default() -> Self {
        Self {
            domain: Region::empty(),
            entries: Vec::new(),
        }
    }
}
