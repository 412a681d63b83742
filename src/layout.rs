//! Brick layout - how a multi-LOD volume is divided into bricks
//!
//! Bricks have a fixed maximum edge length that includes an overlap region
//! duplicated from neighboring bricks. The region a brick *owns* (its core)
//! excludes the overlap; cores tile the domain exactly. Coarser LODs halve
//! the domain per axis until the whole level fits into one brick.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Voxel extents of a single brick within its LOD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrickExtent {
    /// Owned region, `[min, max)` per axis
    pub core_min: [u64; 3],
    pub core_max: [u64; 3],
    /// Stored region including overlap, clamped to the LOD domain
    pub stored_min: [u64; 3],
    pub stored_max: [u64; 3],
}

impl BrickExtent {
    pub fn stored_dims(&self) -> [u64; 3] {
        [
            self.stored_max[0] - self.stored_min[0],
            self.stored_max[1] - self.stored_min[1],
            self.stored_max[2] - self.stored_min[2],
        ]
    }

    pub fn stored_voxels(&self) -> u64 {
        let d = self.stored_dims();
        d[0] * d[1] * d[2]
    }
}

/// Bricking scheme of a volume across all LODs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrickLayout {
    max_brick_size: u64,
    overlap: u64,
    /// Domain size per LOD, finest first
    lod_domains: Vec<[u64; 3]>,
}

impl BrickLayout {
    pub fn new(domain: [u64; 3], max_brick_size: u64, overlap: u64) -> Result<Self> {
        if domain.iter().any(|&d| d == 0) {
            return Err(Error::Format(format!("empty domain {:?}", domain)));
        }
        if max_brick_size <= 2 * overlap {
            return Err(Error::Format(format!(
                "brick size {} does not exceed twice the overlap {}",
                max_brick_size, overlap
            )));
        }

        let usable = max_brick_size - 2 * overlap;
        let mut lod_domains = vec![domain];
        let mut current = domain;
        while current.iter().any(|&d| d > usable) {
            current = [
                (current[0] + 1) / 2,
                (current[1] + 1) / 2,
                (current[2] + 1) / 2,
            ];
            lod_domains.push(current);
        }

        Ok(Self {
            max_brick_size,
            overlap,
            lod_domains,
        })
    }

    pub fn max_brick_size(&self) -> u64 {
        self.max_brick_size
    }

    pub fn overlap(&self) -> u64 {
        self.overlap
    }

    /// Core voxels a brick can own per axis
    pub fn usable_size(&self) -> u64 {
        self.max_brick_size - 2 * self.overlap
    }

    pub fn lod_count(&self) -> usize {
        self.lod_domains.len()
    }

    pub fn domain(&self, lod: usize) -> [u64; 3] {
        self.lod_domains[lod]
    }

    /// Number of bricks per axis at the given LOD
    pub fn brick_count(&self, lod: usize) -> [u64; 3] {
        let domain = self.lod_domains[lod];
        let usable = self.usable_size();
        [
            (domain[0] + usable - 1) / usable,
            (domain[1] + usable - 1) / usable,
            (domain[2] + usable - 1) / usable,
        ]
    }

    pub fn total_bricks(&self, lod: usize) -> usize {
        let c = self.brick_count(lod);
        (c[0] * c[1] * c[2]) as usize
    }

    /// Map a 1D brick index to (x,y,z) brick coordinates, x fastest
    pub fn index_to_coords(&self, lod: usize, index: usize) -> [u64; 3] {
        let counts = self.brick_count(lod);
        let mut rest = index as u64;
        let z = rest / (counts[0] * counts[1]);
        rest %= counts[0] * counts[1];
        let y = rest / counts[0];
        let x = rest % counts[0];
        [x, y, z]
    }

    pub fn coords_to_index(&self, lod: usize, coords: [u64; 3]) -> usize {
        let counts = self.brick_count(lod);
        (coords[2] * counts[0] * counts[1] + coords[1] * counts[0] + coords[0]) as usize
    }

    /// Extents of a brick: owned core plus overlap clamped to the domain
    pub fn brick_extent(&self, lod: usize, coords: [u64; 3]) -> BrickExtent {
        let domain = self.lod_domains[lod];
        let usable = self.usable_size();
        let mut core_min = [0u64; 3];
        let mut core_max = [0u64; 3];
        let mut stored_min = [0u64; 3];
        let mut stored_max = [0u64; 3];
        for axis in 0..3 {
            core_min[axis] = coords[axis] * usable;
            core_max[axis] = (core_min[axis] + usable).min(domain[axis]);
            stored_min[axis] = core_min[axis].saturating_sub(self.overlap);
            stored_max[axis] = (core_max[axis] + self.overlap).min(domain[axis]);
        }
        BrickExtent {
            core_min,
            core_max,
            stored_min,
            stored_max,
        }
    }

    /// Summary string for log output
    pub fn summary(&self) -> String {
        let d = self.lod_domains[0];
        format!(
            "{}x{}x{} volume, {} LODs, brick size {} (overlap {})",
            d[0],
            d[1],
            d[2],
            self.lod_count(),
            self.max_brick_size,
            self.overlap
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> BrickLayout {
        BrickLayout::new([100, 60, 30], 36, 2).unwrap()
    }

    #[test]
    fn test_lod_chain() {
        let l = layout();
        // usable = 32; 100 -> 50 -> 25 fits
        assert_eq!(l.usable_size(), 32);
        assert_eq!(l.lod_count(), 3);
        assert_eq!(l.domain(0), [100, 60, 30]);
        assert_eq!(l.domain(1), [50, 30, 15]);
        assert_eq!(l.domain(2), [25, 15, 8]);
    }

    #[test]
    fn test_brick_counts() {
        let l = layout();
        assert_eq!(l.brick_count(0), [4, 2, 1]);
        assert_eq!(l.brick_count(1), [2, 1, 1]);
        assert_eq!(l.brick_count(2), [1, 1, 1]);
        assert_eq!(l.total_bricks(0), 8);
    }

    #[test]
    fn test_index_round_trip() {
        let l = layout();
        for index in 0..l.total_bricks(0) {
            let coords = l.index_to_coords(0, index);
            assert_eq!(l.coords_to_index(0, coords), index);
        }
        assert_eq!(l.index_to_coords(0, 5), [1, 1, 0]);
    }

    #[test]
    fn test_brick_extent() {
        let l = layout();
        let first = l.brick_extent(0, [0, 0, 0]);
        assert_eq!(first.core_min, [0, 0, 0]);
        assert_eq!(first.core_max, [32, 32, 30]);
        assert_eq!(first.stored_min, [0, 0, 0]);
        assert_eq!(first.stored_max, [34, 34, 30]);

        let last = l.brick_extent(0, [3, 1, 0]);
        assert_eq!(last.core_min, [96, 32, 0]);
        assert_eq!(last.core_max, [100, 60, 30]);
        assert_eq!(last.stored_min, [94, 30, 0]);
        assert_eq!(last.stored_max, [100, 60, 30]);
    }

    #[test]
    fn test_rejects_degenerate() {
        assert!(BrickLayout::new([0, 1, 1], 32, 2).is_err());
        assert!(BrickLayout::new([8, 8, 8], 4, 2).is_err());
    }
}
