//! Auxiliary data blocks carried next to the raster bricks

use crate::types::BrickStats;
use serde::{Deserialize, Serialize};

/// What a non-raster block holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlockSemantic {
    MaxMin = 0,
    Histogram1D = 1,
    Histogram2D = 2,
    Geometry = 3,
}

/// Per-brick min/max acceleration block.
///
/// Values are grouped per component: each call to [`start_new_value`]
/// opens the record for the next brick and [`merge_data`] folds one set of
/// per-component stats into it.
///
/// [`start_new_value`]: MaxMinBlock::start_new_value
/// [`merge_data`]: MaxMinBlock::merge_data
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaxMinBlock {
    pub components: usize,
    per_brick: Vec<Vec<BrickStats>>,
}

impl MaxMinBlock {
    pub fn new(components: usize) -> Self {
        Self {
            components,
            per_brick: Vec::new(),
        }
    }

    /// Open the record for the next brick
    pub fn start_new_value(&mut self) {
        self.per_brick.push(Vec::new());
    }

    /// Fold one set of per-component stats into the current brick record
    pub fn merge_data(&mut self, stats: &[BrickStats]) {
        let current = self
            .per_brick
            .last_mut()
            .expect("start_new_value must precede merge_data");
        if current.is_empty() {
            current.extend_from_slice(stats);
            return;
        }
        for (acc, s) in current.iter_mut().zip(stats.iter()) {
            acc.min = acc.min.min(s.min);
            acc.max = acc.max.max(s.max);
            acc.grad_min = acc.grad_min.min(s.grad_min);
            acc.grad_max = acc.grad_max.max(s.grad_max);
        }
    }

    pub fn brick_count(&self) -> usize {
        self.per_brick.len()
    }

    pub fn brick_stats(&self, brick: usize) -> &[BrickStats] {
        &self.per_brick[brick]
    }

    /// Global (min, max) over every brick and component
    pub fn global_range(&self) -> Option<(f64, f64)> {
        let mut range: Option<(f64, f64)> = None;
        for brick in &self.per_brick {
            for s in brick {
                range = Some(match range {
                    None => (s.min, s.max),
                    Some((mn, mx)) => (mn.min(s.min), mx.max(s.max)),
                });
            }
        }
        range
    }
}

/// 1D scalar histogram
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Histogram1D {
    pub bins: Vec<u64>,
}

impl Histogram1D {
    pub fn bin_count(&self) -> usize {
        self.bins.len()
    }
}

/// 2D histogram over (scalar value, gradient magnitude)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Histogram2D {
    /// Scalar bins (abscissa), matches the 1D histogram bin count
    pub value_bins: usize,
    /// Gradient magnitude bins
    pub gradient_bins: usize,
    /// Row-major counts, `gradient_bins` rows of `value_bins`
    pub bins: Vec<u64>,
    /// Largest scalar value seen while building the raster block
    pub max_value: f64,
}

/// Triangle geometry appended to a volume (e.g. an extracted isosurface)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeometryBlock {
    pub desc: String,
    pub vertices: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub colors: Vec<[f32; 4]>,
    pub indices: Vec<u32>,
}
