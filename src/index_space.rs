use core::ops::Range;
use serde::{Deserialize, Serialize};




/**
 * A cell index in a three-dimensional index space
 */
pub type Index = (i64, i64, i64);




/**
 * Identifier for a Cartesian axis
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Axis {
    I,
    J,
    K,
}




// ============================================================================
impl Axis {
    pub const ALL: [Axis; 3] = [Axis::I, Axis::J, Axis::K];

    /**
     * Return the component of an index along this axis.
     */
    pub fn of(self, index: Index) -> i64 {
        match self {
            Axis::I => index.0,
            Axis::J => index.1,
            Axis::K => index.2,
        }
    }

    /**
     * Return the position of this axis in an `(i, j, k)` tuple.
     */
    pub fn dim(self) -> usize {
        match self {
            Axis::I => 0,
            Axis::J => 1,
            Axis::K => 2,
        }
    }
}




/**
 * Return the index shifted by `delta` along the given axis.
 */
pub fn shift(index: Index, axis: Axis, delta: i64) -> Index {
    match axis {
        Axis::I => (index.0 + delta, index.1, index.2),
        Axis::J => (index.0, index.1 + delta, index.2),
        Axis::K => (index.0, index.1, index.2 + delta),
    }
}




/**
 * Represents a rectangular region in a discrete index space
 */
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexSpace {
    di: Range<i64>,
    dj: Range<i64>,
    dk: Range<i64>,
}




/**
 * Describes a rectangular index space. The index type is signed 64-bit
 * integer. Empty spaces are allowed; they come out of intersections.
 */
impl IndexSpace {


    pub fn new(di: Range<i64>, dj: Range<i64>, dk: Range<i64>) -> Self {

        assert!(
            di.start <= di.end && dj.start <= dj.end && dk.start <= dk.end,
            "index space has negative volume");

        Self { di, dj, dk }
    }


    /**
     * Return the number of indexes on each axis.
     */
    pub fn dim(&self) -> (usize, usize, usize) {
        ((self.di.end - self.di.start) as usize,
         (self.dj.end - self.dj.start) as usize,
         (self.dk.end - self.dk.start) as usize)
    }


    /**
     * Return the number of elements in this index space.
     */
    pub fn len(&self) -> usize {
        let (l, m, n) = self.dim();
        l * m * n
    }


    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }


    /**
     * Return the minimum index (inclusive).
     */
    pub fn start(&self) -> Index {
        (self.di.start, self.dj.start, self.dk.start)
    }


    /**
     * Return the maximum index (exclusive).
     */
    pub fn end(&self) -> Index {
        (self.di.end, self.dj.end, self.dk.end)
    }


    /**
     * Return the range of indexes along one axis.
     */
    pub fn range(&self, axis: Axis) -> Range<i64> {
        match axis {
            Axis::I => self.di.clone(),
            Axis::J => self.dj.clone(),
            Axis::K => self.dk.clone(),
        }
    }


    /**
     * Determine whether this index space contains the given index.
     */
    pub fn contains(&self, index: Index) -> bool {
        self.di.contains(&index.0) && self.dj.contains(&index.1) && self.dk.contains(&index.2)
    }


    /**
     * Determine whether another index space is a subset of this one. The
     * empty space is a subset of everything.
     */
    pub fn contains_space(&self, other: &Self) -> bool {
        other.is_empty() || (
        other.di.start >= self.di.start && other.di.end <= self.di.end &&
        other.dj.start >= self.dj.start && other.dj.end <= self.dj.end &&
        other.dk.start >= self.dk.start && other.dk.end <= self.dk.end)
    }


    /**
     * Return the overlap of two index spaces, or `None` if they are disjoint.
     */
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let clip = |a: &Range<i64>, b: &Range<i64>| a.start.max(b.start)..a.end.min(b.end);
        let di = clip(&self.di, &other.di);
        let dj = clip(&self.dj, &other.dj);
        let dk = clip(&self.dk, &other.dk);

        if di.start < di.end && dj.start < dj.end && dk.start < dk.end {
            Some(Self { di, dj, dk })
        } else {
            None
        }
    }


    /**
     * Determine whether two index spaces share at least one index.
     */
    pub fn overlaps(&self, other: &Self) -> bool {
        self.intersect(other).is_some()
    }


    /**
     * Expand this index space by the given number of elements on each axis.
     */
    pub fn extend_all(&self, delta: i64) -> Self {
        Self::new(
            self.di.start - delta .. self.di.end + delta,
            self.dj.start - delta .. self.dj.end + delta,
            self.dk.start - delta .. self.dk.end + delta)
    }


    /**
     * Trim this index space by the given number of elements on each axis.
     */
    pub fn trim_all(&self, delta: i64) -> Self {
        self.extend_all(-delta)
    }


    /**
     * Move the lower and upper bounds on one axis by the given amounts.
     * Positive values grow the space in both directions.
     */
    pub fn extend_axis(&self, axis: Axis, lower: i64, upper: i64) -> Self {
        let grow = |r: &Range<i64>| r.start - lower .. r.end + upper;
        match axis {
            Axis::I => Self::new(grow(&self.di), self.dj.clone(), self.dk.clone()),
            Axis::J => Self::new(self.di.clone(), grow(&self.dj), self.dk.clone()),
            Axis::K => Self::new(self.di.clone(), self.dj.clone(), grow(&self.dk)),
        }
    }


    /**
     * Return the one-index-thick layer of this space at the lower or upper end
     * of the given axis.
     */
    pub fn layer(&self, axis: Axis, upper: bool) -> Self {
        let r = self.range(axis);
        let slab = if upper { r.end - 1 .. r.end } else { r.start .. r.start + 1 };
        self.with_range(axis, slab)
    }


    /**
     * Replace the range along one axis.
     */
    pub fn with_range(&self, axis: Axis, range: Range<i64>) -> Self {
        match axis {
            Axis::I => Self::new(range, self.dj.clone(), self.dk.clone()),
            Axis::J => Self::new(self.di.clone(), range, self.dk.clone()),
            Axis::K => Self::new(self.di.clone(), self.dj.clone(), range),
        }
    }


    /**
     * Increase the size of this index space by the given factor on each axis.
     * This maps a coarse index space onto the fine cells it covers.
     */
    pub fn refine(&self, ratio: Index) -> Self {
        Self::new(
            self.di.start * ratio.0 .. self.di.end * ratio.0,
            self.dj.start * ratio.1 .. self.dj.end * ratio.1,
            self.dk.start * ratio.2 .. self.dk.end * ratio.2)
    }


    /**
     * Return the smallest coarse index space covering this one.
     */
    pub fn coarsen(&self, ratio: Index) -> Self {
        let down = |r: &Range<i64>, n: i64| r.start.div_euclid(n) .. (r.end + n - 1).div_euclid(n);
        Self::new(
            down(&self.di, ratio.0),
            down(&self.dj, ratio.1),
            down(&self.dk, ratio.2))
    }


    /**
     * Return the linear offset for the given index, in a row-major memory
     * buffer aligned with the start of this index space.
     */
    pub fn row_major_offset(&self, index: Index) -> usize {
        let i = (index.0 - self.di.start) as usize;
        let j = (index.1 - self.dj.start) as usize;
        let k = (index.2 - self.dk.start) as usize;
        let (_, m, n) = self.dim();
        (i * m + j) * n + k
    }


    /**
     * Return an iterator which traverses the index space in row-major order
     * (C-like; the final index increases fastest).
     */
    pub fn iter(&self) -> impl Iterator<Item = Index> + '_ {
        self.di.clone().flat_map(move |i| {
            self.dj.clone().flat_map(move |j| self.dk.clone().map(move |k| (i, j, k)))
        })
    }
}




// ============================================================================
impl From<(Range<i64>, Range<i64>, Range<i64>)> for IndexSpace {
    fn from(range: (Range<i64>, Range<i64>, Range<i64>)) -> Self {
        Self::new(range.0, range.1, range.2)
    }
}

impl From<IndexSpace> for (Range<i64>, Range<i64>, Range<i64>) {
    fn from(space: IndexSpace) -> Self {
        (space.di, space.dj, space.dk)
    }
}




/**
 * Less imposing factory function to construct an IndexSpace object.
 */
pub fn range3d(di: Range<i64>, dj: Range<i64>, dk: Range<i64>) -> IndexSpace {
    IndexSpace::new(di, dj, dk)
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{range3d, Axis};


    #[test]
    fn row_major_traversal_matches_offsets() {
        let space = range3d(-1..2, 0..3, 4..6);
        for (n, index) in space.iter().enumerate() {
            assert_eq!(space.row_major_offset(index), n);
        }
        assert_eq!(space.iter().count(), space.len());
    }


    #[test]
    fn intersection_of_disjoint_spaces_is_none() {
        let a = range3d(0..4, 0..4, 0..4);
        let b = range3d(4..8, 0..4, 0..4);
        assert!(a.intersect(&b).is_none());
        assert_eq!(a.intersect(&a.extend_all(1)), Some(a.clone()));
    }


    #[test]
    fn coarsening_rounds_outward() {
        let fine = range3d(-1..5, 0..4, 3..4);
        assert_eq!(fine.coarsen((2, 2, 2)), range3d(-1..3, 0..2, 1..2));
        assert_eq!(range3d(0..2, 0..2, 0..2).refine((2, 2, 2)), range3d(0..4, 0..4, 0..4));
    }


    #[test]
    fn layers_are_one_cell_thick() {
        let space = range3d(0..4, 0..5, 0..6);
        assert_eq!(space.layer(Axis::J, true), range3d(0..4, 4..5, 0..6));
        assert_eq!(space.layer(Axis::K, false), range3d(0..4, 0..5, 0..1));
        assert_eq!(space.extend_axis(Axis::I, 0, 1), range3d(0..5, 0..5, 0..6));
    }
}
