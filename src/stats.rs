//! Per-brick min/max and histogram construction for a container in progress
//!
//! Statistics are computed by reading bricks back from the builder with the
//! statically known voxel type: min/max over every (LOD, brick) pair feeds
//! the min/max acceleration block, then the 1D histogram is computed over
//! the finest LOD and its bin count fixes the abscissa of the 2D histogram.

use crate::error::{Error, Result};
use crate::layout::BrickExtent;
use crate::types::{
    dispatch_scalar, scalars_from_bytes, BrickKey, BrickStats, DataType, ValueRange, VoxelScalar,
};
use crate::uvf::{BlockSemantic, Histogram1D, Histogram2D, MaxMinBlock, UvfBuilder};
use tracing::info;

/// Gradient magnitude bins of the 2D histogram
const GRADIENT_BINS: usize = 256;

/// Compute the min/max block and both histograms and append them to the
/// container. Also refreshes the metadata value range from the finest LOD.
pub fn append_statistics(builder: &mut UvfBuilder) -> Result<()> {
    let data_type = builder.metadata().volume.data_type;
    let components = builder.metadata().volume.components;
    let layout = builder.metadata().layout.clone();

    if matches!(data_type, DataType::I64 | DataType::U64) {
        return Err(Error::UnsupportedType(
            "64-bit integer voxels are not supported in statistics".into(),
        ));
    }

    let mut maxmin = MaxMinBlock::new(components);
    let mut range: Option<(f64, f64)> = None;

    for lod in 0..layout.lod_count() {
        let bricks = layout.total_bricks(lod);
        for index in 0..bricks {
            let key = BrickKey::new(lod, index);
            let data = builder.read_brick(key)?;
            let stats =
                dispatch_scalar!(data_type, T => typed_brick_stats::<T>(&data, components))?;

            maxmin.start_new_value();
            maxmin.merge_data(&stats);

            if lod == 0 {
                for s in &stats {
                    range = Some(match range {
                        None => (s.min, s.max),
                        Some((mn, mx)) => (mn.min(s.min), mx.max(s.max)),
                    });
                }
            }
        }
        info!("min/max: finished LOD {} ({} bricks)", lod, bricks);
    }

    let (min, max) = range.unwrap_or((0.0, 0.0));
    builder.metadata_mut().value_range = ValueRange::new(min, max);
    builder.append_block(BlockSemantic::MaxMin, &maxmin)?;

    let hist1d = compute_histogram_1d(builder, min, max)?;
    let value_bins = hist1d.bin_count();
    builder.append_block(BlockSemantic::Histogram1D, &hist1d)?;
    info!("1D histogram: {} bins", value_bins);

    let hist2d = compute_histogram_2d(builder, value_bins, min, max)?;
    builder.append_block(BlockSemantic::Histogram2D, &hist2d)?;
    info!("2D histogram: {}x{} bins", GRADIENT_BINS, value_bins);

    Ok(())
}

/// Min/max per component over one brick buffer
fn typed_brick_stats<T: VoxelScalar>(bytes: &[u8], components: usize) -> Result<Vec<BrickStats>> {
    if matches!(T::DATA_TYPE, DataType::I64 | DataType::U64) {
        return Err(Error::UnsupportedType(
            "64-bit integer voxels are not supported in statistics".into(),
        ));
    }
    let data: Vec<T> = scalars_from_bytes(bytes)?;
    let mut min = vec![f64::INFINITY; components];
    let mut max = vec![f64::NEG_INFINITY; components];
    for voxel in data.chunks_exact(components) {
        for (c, v) in voxel.iter().enumerate() {
            let v = v.to_f64();
            min[c] = min[c].min(v);
            max[c] = max[c].max(v);
        }
    }
    Ok((0..components)
        .map(|c| BrickStats::scalar(min[c], max[c]))
        .collect())
}

fn bin_count_for(data_type: DataType) -> usize {
    if data_type.bit_width() == 8 {
        256
    } else {
        4096
    }
}

fn value_bin(v: f64, min: f64, extent: f64, bins: usize) -> usize {
    if extent <= 0.0 {
        return 0;
    }
    (((v - min) / extent) * (bins - 1) as f64)
        .clamp(0.0, (bins - 1) as f64) as usize
}

/// 1D histogram over the core voxels of the finest LOD
fn compute_histogram_1d(builder: &mut UvfBuilder, min: f64, max: f64) -> Result<Histogram1D> {
    let data_type = builder.metadata().volume.data_type;
    let components = builder.metadata().volume.components;
    let layout = builder.metadata().layout.clone();
    let bins = bin_count_for(data_type);
    let extent = max - min;

    let mut hist = vec![0u64; bins];
    for index in 0..layout.total_bricks(0) {
        let coords = layout.index_to_coords(0, index);
        let extent_box = layout.brick_extent(0, coords);
        let data = builder.read_brick(BrickKey::new(0, index))?;
        dispatch_scalar!(data_type, T => {
            let scalars: Vec<T> = scalars_from_bytes(&data)?;
            for_each_core_voxel(&extent_box, |stored_index| {
                for c in 0..components {
                    let v = scalars[stored_index * components + c].to_f64();
                    hist[value_bin(v, min, extent, bins)] += 1;
                }
            });
        });
    }
    Ok(Histogram1D { bins: hist })
}

/// 2D histogram over (value, gradient magnitude), first component only.
/// The abscissa spans `[min, max]` where `max` is the global maximum the
/// min/max pass found.
fn compute_histogram_2d(
    builder: &mut UvfBuilder,
    value_bins: usize,
    min: f64,
    max: f64,
) -> Result<Histogram2D> {
    let data_type = builder.metadata().volume.data_type;
    let components = builder.metadata().volume.components;
    let layout = builder.metadata().layout.clone();
    let extent = max - min;
    // central differences can at most span the whole value range per axis
    let max_gradient = if extent > 0.0 {
        extent * 3f64.sqrt()
    } else {
        1.0
    };

    let mut bins = vec![0u64; GRADIENT_BINS * value_bins];
    for index in 0..layout.total_bricks(0) {
        let coords = layout.index_to_coords(0, index);
        let brick = layout.brick_extent(0, coords);
        let dims = brick.stored_dims();
        let data = builder.read_brick(BrickKey::new(0, index))?;
        dispatch_scalar!(data_type, T => {
            let scalars: Vec<T> = scalars_from_bytes(&data)?;
            let sample = |x: u64, y: u64, z: u64| -> f64 {
                let idx = ((z * dims[1] + y) * dims[0] + x) as usize;
                scalars[idx * components].to_f64()
            };
            for z in brick.core_min[2]..brick.core_max[2] {
                let lz = z - brick.stored_min[2];
                for y in brick.core_min[1]..brick.core_max[1] {
                    let ly = y - brick.stored_min[1];
                    for x in brick.core_min[0]..brick.core_max[0] {
                        let lx = x - brick.stored_min[0];
                        let v = sample(lx, ly, lz);
                        let gx = sample((lx + 1).min(dims[0] - 1), ly, lz)
                            - sample(lx.saturating_sub(1), ly, lz);
                        let gy = sample(lx, (ly + 1).min(dims[1] - 1), lz)
                            - sample(lx, ly.saturating_sub(1), lz);
                        let gz = sample(lx, ly, (lz + 1).min(dims[2] - 1))
                            - sample(lx, ly, lz.saturating_sub(1));
                        let gmag = ((gx * gx + gy * gy + gz * gz).sqrt() / 2.0) / max_gradient;
                        let grow = (gmag * (GRADIENT_BINS - 1) as f64)
                            .clamp(0.0, (GRADIENT_BINS - 1) as f64)
                            as usize;
                        let vcol = value_bin(v, min, extent, value_bins);
                        bins[grow * value_bins + vcol] += 1;
                    }
                }
            }
        });
    }

    Ok(Histogram2D {
        value_bins,
        gradient_bins: GRADIENT_BINS,
        bins,
        max_value: max,
    })
}

/// Visit every core voxel of a brick, yielding its index into the stored
/// (overlap-including) buffer.
fn for_each_core_voxel(extent: &BrickExtent, mut f: impl FnMut(usize)) {
    let dims = extent.stored_dims();
    for z in extent.core_min[2]..extent.core_max[2] {
        let lz = z - extent.stored_min[2];
        for y in extent.core_min[1]..extent.core_max[1] {
            let ly = y - extent.stored_min[1];
            for x in extent.core_min[0]..extent.core_max[0] {
                let lx = x - extent.stored_min[0];
                f(((lz * dims[1] + ly) * dims[0] + lx) as usize);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_brick_stats() {
        let data: Vec<u8> = vec![5, 1, 9, 3];
        let stats = typed_brick_stats::<u8>(&data, 1).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].min, 1.0);
        assert_eq!(stats[0].max, 9.0);
    }

    #[test]
    fn test_typed_brick_stats_components() {
        // interleaved (r,g) pairs
        let data: Vec<u8> = vec![10, 200, 30, 100];
        let stats = typed_brick_stats::<u8>(&data, 2).unwrap();
        assert_eq!(stats[0].min, 10.0);
        assert_eq!(stats[0].max, 30.0);
        assert_eq!(stats[1].min, 100.0);
        assert_eq!(stats[1].max, 200.0);
    }

    #[test]
    fn test_wide_ints_rejected() {
        let data = vec![0u8; 16];
        assert!(matches!(
            typed_brick_stats::<u64>(&data, 1),
            Err(Error::UnsupportedType(_))
        ));
        assert!(matches!(
            typed_brick_stats::<i64>(&data, 1),
            Err(Error::UnsupportedType(_))
        ));
    }

    #[test]
    fn test_value_bin() {
        assert_eq!(value_bin(0.0, 0.0, 255.0, 256), 0);
        assert_eq!(value_bin(255.0, 0.0, 255.0, 256), 255);
        assert_eq!(value_bin(5.0, 0.0, 0.0, 256), 0);
    }
}
