// SPDX-License-Identifier: AGPL-3.0-only

//! Core coordinates on a single chip.
//!
//! Logical coordinates index the worker (Tensix) grid or the ethernet core
//! list independently. NOC coordinates are what the on-chip network uses;
//! see [`crate::chip::ChipSpec::noc_coord`] for the translation.

use std::collections::BTreeSet;
use std::fmt;

/// Kind of core a coordinate refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CoreType {
    /// Compute core on the worker grid.
    Tensix,
    /// Ethernet core bound to an off-chip link.
    Ethernet,
}

/// A single core, `x` is the column and `y` the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CoreCoord {
    /// Column.
    pub x: u32,
    /// Row.
    pub y: u32,
}

impl CoreCoord {
    /// Create a coordinate.
    #[must_use]
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for CoreCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Inclusive rectangle of cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoreRange {
    /// Top-left corner.
    pub start: CoreCoord,
    /// Bottom-right corner (inclusive).
    pub end: CoreCoord,
}

impl CoreRange {
    /// Create a range; corners are normalised so `start <= end` on both axes.
    #[must_use]
    pub fn new(a: CoreCoord, b: CoreCoord) -> Self {
        Self {
            start: CoreCoord::new(a.x.min(b.x), a.y.min(b.y)),
            end: CoreCoord::new(a.x.max(b.x), a.y.max(b.y)),
        }
    }

    /// Range holding exactly one core.
    #[must_use]
    pub const fn single(core: CoreCoord) -> Self {
        Self { start: core, end: core }
    }

    /// Whether `core` lies inside the range.
    #[must_use]
    pub const fn contains(&self, core: CoreCoord) -> bool {
        core.x >= self.start.x && core.x <= self.end.x && core.y >= self.start.y && core.y <= self.end.y
    }

    /// Whether the two ranges share at least one core.
    #[must_use]
    pub const fn intersects(&self, other: &Self) -> bool {
        self.start.x <= other.end.x
            && other.start.x <= self.end.x
            && self.start.y <= other.end.y
            && other.start.y <= self.end.y
    }

    /// Number of cores covered.
    #[must_use]
    pub const fn num_cores(&self) -> usize {
        ((self.end.x - self.start.x + 1) * (self.end.y - self.start.y + 1)) as usize
    }

    /// Iterate cores in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = CoreCoord> + '_ {
        (self.start.y..=self.end.y)
            .flat_map(move |y| (self.start.x..=self.end.x).map(move |x| CoreCoord::new(x, y)))
    }
}

impl From<CoreCoord> for CoreRange {
    fn from(core: CoreCoord) -> Self {
        Self::single(core)
    }
}

/// Set of core ranges.
///
/// Ranges may touch or overlap; queries work on the union.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CoreRangeSet {
    ranges: Vec<CoreRange>,
}

impl CoreRangeSet {
    /// Empty set.
    #[must_use]
    pub const fn empty() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Build a set from ranges.
    #[must_use]
    pub fn new(ranges: impl IntoIterator<Item = CoreRange>) -> Self {
        Self {
            ranges: ranges.into_iter().collect(),
        }
    }

    /// Underlying ranges, as added.
    #[must_use]
    pub fn ranges(&self) -> &[CoreRange] {
        &self.ranges
    }

    /// Whether the set covers no cores.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Union with another set.
    #[must_use]
    pub fn merge(mut self, other: &Self) -> Self {
        self.ranges.extend_from_slice(&other.ranges);
        self
    }

    /// Whether `core` is in any range.
    #[must_use]
    pub fn contains(&self, core: CoreCoord) -> bool {
        self.ranges.iter().any(|r| r.contains(core))
    }

    /// Whether any core is shared with `other`.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.ranges
            .iter()
            .any(|a| other.ranges.iter().any(|b| a.intersects(b)))
    }

    /// Whether every core of `other` is in this set.
    #[must_use]
    pub fn contains_set(&self, other: &Self) -> bool {
        other.iter().all(|c| self.contains(c))
    }

    /// Distinct cores in the set.
    #[must_use]
    pub fn num_cores(&self) -> usize {
        self.cores().len()
    }

    /// Distinct cores, sorted by (x, y).
    #[must_use]
    pub fn cores(&self) -> BTreeSet<CoreCoord> {
        self.ranges.iter().flat_map(CoreRange::iter).collect()
    }

    /// Iterate distinct cores.
    pub fn iter(&self) -> impl Iterator<Item = CoreCoord> {
        self.cores().into_iter()
    }

    /// Largest x and y used by any range, if any.
    #[must_use]
    pub fn bounding_end(&self) -> Option<CoreCoord> {
        self.ranges.iter().fold(None, |acc, r| {
            Some(match acc {
                None => r.end,
                Some(c) => CoreCoord::new(c.x.max(r.end.x), c.y.max(r.end.y)),
            })
        })
    }
}

impl From<CoreRange> for CoreRangeSet {
    fn from(range: CoreRange) -> Self {
        Self { ranges: vec![range] }
    }
}

impl From<CoreCoord> for CoreRangeSet {
    fn from(core: CoreCoord) -> Self {
        Self::from(CoreRange::single(core))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_normalises_corners() {
        let r = CoreRange::new(CoreCoord::new(3, 2), CoreCoord::new(1, 0));
        assert_eq!(r.start, CoreCoord::new(1, 0));
        assert_eq!(r.end, CoreCoord::new(3, 2));
        assert_eq!(r.num_cores(), 9);
    }

    #[test]
    fn range_intersection() {
        let a = CoreRange::new(CoreCoord::new(0, 0), CoreCoord::new(3, 3));
        let b = CoreRange::new(CoreCoord::new(3, 3), CoreCoord::new(5, 5));
        let c = CoreRange::new(CoreCoord::new(4, 0), CoreCoord::new(7, 2));
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert!(!b.intersects(&c));
    }

    #[test]
    fn set_counts_distinct_cores() {
        let set = CoreRangeSet::new([
            CoreRange::new(CoreCoord::new(0, 0), CoreCoord::new(1, 1)),
            CoreRange::new(CoreCoord::new(1, 1), CoreCoord::new(2, 1)),
        ]);
        assert_eq!(set.num_cores(), 5);
        assert!(set.contains(CoreCoord::new(2, 1)));
        assert!(!set.contains(CoreCoord::new(2, 0)));
    }

    #[test]
    fn iteration_is_row_major() {
        let r = CoreRange::new(CoreCoord::new(0, 0), CoreCoord::new(1, 1));
        let cores: Vec<_> = r.iter().collect();
        assert_eq!(
            cores,
            vec![
                CoreCoord::new(0, 0),
                CoreCoord::new(1, 0),
                CoreCoord::new(0, 1),
                CoreCoord::new(1, 1)
            ]
        );
    }
}
