//! Inclusive voxel index extents
//!
//! An extent is `[imin, imax, jmin, jmax, kmin, kmax]`, inclusive on both
//! ends. Any axis with `min > max` makes the whole extent empty.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Inclusive integer voxel index box
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent(pub [i64; 6]);

impl Extent {
    /// The canonical empty extent
    pub const EMPTY: Extent = Extent([0, -1, 0, -1, 0, -1]);

    /// Create an extent from its six bounds
    pub fn new(imin: i64, imax: i64, jmin: i64, jmax: i64, kmin: i64, kmax: i64) -> Self {
        Extent([imin, imax, jmin, jmax, kmin, kmax])
    }

    /// Extent of a `dims[0] x dims[1] x dims[2]` grid starting at index 0
    pub fn from_dimensions(dims: [usize; 3]) -> Self {
        Extent([
            0,
            dims[0] as i64 - 1,
            0,
            dims[1] as i64 - 1,
            0,
            dims[2] as i64 - 1,
        ])
    }

    #[inline]
    pub fn min(&self, axis: usize) -> i64 {
        self.0[axis * 2]
    }

    #[inline]
    pub fn max(&self, axis: usize) -> i64 {
        self.0[axis * 2 + 1]
    }

    /// Check whether the extent contains no voxel
    pub fn is_empty(&self) -> bool {
        (0..3).any(|axis| self.min(axis) > self.max(axis))
    }

    /// Number of voxels along each axis (zero for empty extents)
    pub fn dimensions(&self) -> [usize; 3] {
        if self.is_empty() {
            return [0, 0, 0];
        }
        [
            (self.max(0) - self.min(0) + 1) as usize,
            (self.max(1) - self.min(1) + 1) as usize,
            (self.max(2) - self.min(2) + 1) as usize,
        ]
    }

    /// Total number of voxels
    pub fn voxel_count(&self) -> usize {
        let dims = self.dimensions();
        dims[0] * dims[1] * dims[2]
    }

    /// Check whether a voxel index lies inside the extent
    #[inline]
    pub fn contains(&self, i: i64, j: i64, k: i64) -> bool {
        i >= self.0[0]
            && i <= self.0[1]
            && j >= self.0[2]
            && j <= self.0[3]
            && k >= self.0[4]
            && k <= self.0[5]
    }

    /// Check whether `other` lies fully inside this extent
    pub fn contains_extent(&self, other: &Extent) -> bool {
        if other.is_empty() {
            return true;
        }
        (0..3).all(|axis| other.min(axis) >= self.min(axis) && other.max(axis) <= self.max(axis))
    }

    /// Intersection of two extents (may be empty)
    pub fn intersect(&self, other: &Extent) -> Extent {
        let mut result = [0i64; 6];
        for axis in 0..3 {
            result[axis * 2] = self.min(axis).max(other.min(axis));
            result[axis * 2 + 1] = self.max(axis).min(other.max(axis));
        }
        Extent(result)
    }

    /// Smallest extent containing both; an empty operand is ignored
    pub fn union(&self, other: &Extent) -> Extent {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let mut result = [0i64; 6];
        for axis in 0..3 {
            result[axis * 2] = self.min(axis).min(other.min(axis));
            result[axis * 2 + 1] = self.max(axis).max(other.max(axis));
        }
        Extent(result)
    }

    /// Check whether two extents share at least one voxel
    pub fn overlaps(&self, other: &Extent) -> bool {
        !self.intersect(other).is_empty()
    }

    /// Grow every non-empty axis by `voxels` on both sides
    pub fn padded(&self, voxels: i64) -> Extent {
        let mut result = self.0;
        for axis in 0..3 {
            if result[axis * 2] > result[axis * 2 + 1] {
                continue;
            }
            result[axis * 2] -= voxels;
            result[axis * 2 + 1] += voxels;
        }
        Extent(result)
    }

    /// Iterate over every voxel index in i-fastest order
    pub fn iter(&self) -> impl Iterator<Item = [i64; 3]> {
        let e = *self;
        let empty = e.is_empty();
        let (k0, k1) = if empty { (0, -1) } else { (e.0[4], e.0[5]) };
        (k0..=k1).flat_map(move |k| {
            (e.0[2]..=e.0[3]).flat_map(move |j| (e.0[0]..=e.0[1]).map(move |i| [i, j, k]))
        })
    }
}

impl Default for Extent {
    fn default() -> Self {
        Extent::EMPTY
    }
}

impl From<[i64; 6]> for Extent {
    fn from(value: [i64; 6]) -> Self {
        Extent(value)
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}, {}, {}]",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_extent() {
        assert!(Extent::EMPTY.is_empty());
        assert_eq!(Extent::EMPTY.voxel_count(), 0);
        assert_eq!(Extent::EMPTY.iter().count(), 0);
        assert!(!Extent::new(0, 0, 0, 0, 0, 0).is_empty());
    }

    #[test]
    fn test_dimensions() {
        let extent = Extent::new(0, 9, 0, 9, 0, 4);
        assert_eq!(extent.dimensions(), [10, 10, 5]);
        assert_eq!(extent.voxel_count(), 500);
        assert_eq!(extent, Extent::from_dimensions([10, 10, 5]));
    }

    #[test]
    fn test_intersect_and_union() {
        let a = Extent::new(0, 5, 0, 5, 0, 5);
        let b = Extent::new(3, 8, -2, 2, 4, 10);
        assert_eq!(a.intersect(&b), Extent::new(3, 5, 0, 2, 4, 5));
        assert_eq!(a.union(&b), Extent::new(0, 8, -2, 5, 0, 10));

        let c = Extent::new(6, 7, 0, 5, 0, 5);
        assert!(!a.overlaps(&c));
        assert_eq!(a.union(&Extent::EMPTY), a);
    }

    #[test]
    fn test_padded_skips_empty_axes() {
        let extent = Extent::new(0, 3, 2, 1, 0, 0);
        assert_eq!(extent.padded(1), Extent::new(-1, 4, 2, 1, -1, 1));
    }

    #[test]
    fn test_iter_order() {
        let extent = Extent::new(0, 1, 0, 1, 0, 0);
        let voxels: Vec<[i64; 3]> = extent.iter().collect();
        assert_eq!(voxels, vec![[0, 0, 0], [1, 0, 0], [0, 1, 0], [1, 1, 0]]);
    }
}
