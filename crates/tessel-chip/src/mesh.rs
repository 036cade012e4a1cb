//! Logical mesh coordinate model.
//!
//! A mesh is a rank-1 line or a rank-2 grid of chips. Rank-1 shapes and
//! coordinates are treated as a single row wherever a 2-D view is needed,
//! so `MeshShape::line(8)` behaves like `1x8` for addressing.

use std::fmt;

/// Shape of a logical mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshShape {
    dims: [u32; 2],
    rank: u8,
}

impl MeshShape {
    /// Rank-2 shape `rows x cols`.
    #[must_use]
    pub const fn new(rows: u32, cols: u32) -> Self {
        Self { dims: [rows, cols], rank: 2 }
    }

    /// Rank-1 shape of `n` chips.
    #[must_use]
    pub const fn line(n: u32) -> Self {
        Self { dims: [1, n], rank: 1 }
    }

    /// 1 or 2.
    #[must_use]
    pub const fn rank(&self) -> usize {
        self.rank as usize
    }

    /// Rows in the 2-D view.
    #[must_use]
    pub const fn rows(&self) -> u32 {
        self.dims[0]
    }

    /// Columns in the 2-D view.
    #[must_use]
    pub const fn cols(&self) -> u32 {
        self.dims[1]
    }

    /// Total chips.
    #[must_use]
    pub const fn num_devices(&self) -> usize {
        (self.dims[0] * self.dims[1]) as usize
    }

    /// Whether the shape is one-dimensional (rank 1, `1xN` or `Nx1`).
    #[must_use]
    pub const fn is_line(&self) -> bool {
        self.rank == 1 || self.dims[0] == 1 || self.dims[1] == 1
    }

    /// Shape with rows and columns swapped.
    #[must_use]
    pub const fn transposed(&self) -> Self {
        Self {
            dims: [self.dims[1], self.dims[0]],
            rank: self.rank,
        }
    }

    /// Whether `coord` addresses a chip inside this shape.
    #[must_use]
    pub const fn contains(&self, coord: MeshCoordinate) -> bool {
        coord.row() < self.rows() && coord.col() < self.cols()
    }

    /// Row-major index of `coord`.
    #[must_use]
    pub const fn linear_index(&self, coord: MeshCoordinate) -> usize {
        (coord.row() * self.cols() + coord.col()) as usize
    }

    /// Coordinate for a row-major index.
    #[must_use]
    pub const fn coord_at(&self, index: usize) -> MeshCoordinate {
        let i = index as u32;
        if self.rank == 1 {
            MeshCoordinate::line(i)
        } else {
            MeshCoordinate::new(i / self.cols(), i % self.cols())
        }
    }

    /// Iterate every coordinate in row-major order.
    pub fn coords(&self) -> impl Iterator<Item = MeshCoordinate> + '_ {
        (0..self.num_devices()).map(|i| self.coord_at(i))
    }
}

impl fmt::Display for MeshShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rank == 1 {
            write!(f, "{}", self.dims[1])
        } else {
            write!(f, "{}x{}", self.dims[0], self.dims[1])
        }
    }
}

/// Position of one chip in a logical mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshCoordinate {
    row: u32,
    col: u32,
    rank: u8,
}

impl MeshCoordinate {
    /// Rank-2 coordinate.
    #[must_use]
    pub const fn new(row: u32, col: u32) -> Self {
        Self { row, col, rank: 2 }
    }

    /// Rank-1 coordinate.
    #[must_use]
    pub const fn line(index: u32) -> Self {
        Self { row: 0, col: index, rank: 1 }
    }

    /// Origin of the given rank.
    #[must_use]
    pub const fn zero(rank: usize) -> Self {
        if rank == 1 {
            Self::line(0)
        } else {
            Self::new(0, 0)
        }
    }

    /// 1 or 2.
    #[must_use]
    pub const fn rank(&self) -> usize {
        self.rank as usize
    }

    /// Row in the 2-D view.
    #[must_use]
    pub const fn row(&self) -> u32 {
        self.row
    }

    /// Column in the 2-D view.
    #[must_use]
    pub const fn col(&self) -> u32 {
        self.col
    }

    /// Whether every component is zero.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.row == 0 && self.col == 0
    }
}

impl fmt::Display for MeshCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rank == 1 {
            write!(f, "({})", self.col)
        } else {
            write!(f, "({}, {})", self.row, self.col)
        }
    }
}

/// Inclusive rectangle of mesh coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogicalDeviceRange {
    start: MeshCoordinate,
    end: MeshCoordinate,
}

impl LogicalDeviceRange {
    /// Range from `start` to `end` inclusive. Returns `None` unless
    /// `start <= end` on both axes.
    #[must_use]
    pub const fn new(start: MeshCoordinate, end: MeshCoordinate) -> Option<Self> {
        if start.row <= end.row && start.col <= end.col {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// Range of a single chip.
    #[must_use]
    pub const fn single(coord: MeshCoordinate) -> Self {
        Self { start: coord, end: coord }
    }

    /// Range covering a whole mesh.
    #[must_use]
    pub const fn full(shape: MeshShape) -> Self {
        Self {
            start: MeshCoordinate::new(0, 0),
            end: MeshCoordinate::new(shape.rows() - 1, shape.cols() - 1),
        }
    }

    /// First corner.
    #[must_use]
    pub const fn start(&self) -> MeshCoordinate {
        self.start
    }

    /// Last corner (inclusive).
    #[must_use]
    pub const fn end(&self) -> MeshCoordinate {
        self.end
    }

    /// Chips covered.
    #[must_use]
    pub const fn num_devices(&self) -> usize {
        ((self.end.row - self.start.row + 1) * (self.end.col - self.start.col + 1)) as usize
    }

    /// Whether the range lies inside `shape`.
    #[must_use]
    pub const fn fits_within(&self, shape: MeshShape) -> bool {
        shape.contains(self.end)
    }

    /// Whether `coord` is inside the range.
    #[must_use]
    pub const fn contains(&self, coord: MeshCoordinate) -> bool {
        coord.row >= self.start.row
            && coord.row <= self.end.row
            && coord.col >= self.start.col
            && coord.col <= self.end.col
    }

    /// Whether the two ranges share a chip.
    #[must_use]
    pub const fn intersects(&self, other: &Self) -> bool {
        self.start.row <= other.end.row
            && other.start.row <= self.end.row
            && self.start.col <= other.end.col
            && other.start.col <= self.end.col
    }

    /// Iterate covered coordinates in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = MeshCoordinate> + '_ {
        (self.start.row..=self.end.row).flat_map(move |r| {
            (self.start.col..=self.end.col).map(move |c| MeshCoordinate::new(r, c))
        })
    }
}

impl fmt::Display for LogicalDeviceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Serpentine walk of a `rows x cols` grid: even rows left to right, odd
/// rows right to left. Consecutive entries are always grid neighbours.
#[must_use]
pub fn boustrophedon(rows: u32, cols: u32) -> Vec<(u32, u32)> {
    (0..rows)
        .flat_map(|r| {
            let row: Vec<(u32, u32)> = if r % 2 == 0 {
                (0..cols).map(|c| (r, c)).collect()
            } else {
                (0..cols).rev().map(|c| (r, c)).collect()
            };
            row
        })
        .collect()
}
