//! Voxel-wise expression evaluation across co-registered volumes
//!
//! All inputs must be mergeable (same component count, overlap, LOD and
//! timestep structure, per-level domains and brick counts). Bricks are then
//! co-iterated: every input contributes the same-keyed brick, rescaled into
//! the widest common type, the expression runs voxel by voxel, and the
//! result streams into the output container under the same key.

use crate::error::{Error, Result};
use crate::expr::{self, Node};
use crate::stats;
use crate::types::{
    bytes_from_scalars, dispatch_scalar, scalars_from_bytes, BrickKey, DataType, VoxelScalar,
};
use crate::uvf::{UvfBuilder, UvfDataset, UvfMetadata};
use std::path::{Path, PathBuf};
use tracing::info;

/// Evaluate `expression` over `volumes` (bound to `v0..vN-1`) and write the
/// result as a new UVF at `output`.
pub fn evaluate_expression(expression: &str, volumes: &[PathBuf], output: &Path) -> Result<()> {
    if volumes.is_empty() {
        return Err(Error::Incompatible("no input volumes".into()));
    }

    let tree = expr::parse(expression)?;
    if let Some(max_var) = tree.max_variable() {
        if max_var >= volumes.len() {
            return Err(Error::Incompatible(format!(
                "expression references v{} but only {} volume(s) were given",
                max_var,
                volumes.len()
            )));
        }
    }

    let mut inputs: Vec<UvfDataset> = Vec::with_capacity(volumes.len());
    for path in volumes {
        let mut ds = UvfDataset::open(path)?;
        ds.compute_range()?;
        inputs.push(ds);
    }

    ensure_mergeable(&inputs)?;

    // widest common voxel type across all inputs
    let mut dest_type = inputs[0].data_type();
    for ds in &inputs[1..] {
        dest_type = dest_type.widest(ds.data_type())?;
    }
    if matches!(
        dest_type,
        DataType::I32 | DataType::U32 | DataType::I64 | DataType::U64 | DataType::F64
    ) {
        return Err(Error::UnsupportedType(format!(
            "{} output rasters are not supported",
            dest_type
        )));
    }
    info!("expression output type: {}", dest_type);

    let mut metadata = UvfMetadata::new(
        inputs[0].metadata().volume.clone(),
        inputs[0].layout().clone(),
    );
    metadata.volume.data_type = dest_type;
    metadata.volume.title = format!("expression {}", tree);
    metadata.volume.source = volumes
        .iter()
        .map(|p| crate::util::file_name(p))
        .collect::<Vec<_>>()
        .join(" ");
    let mut builder = UvfBuilder::create(output, metadata)?;

    dispatch_scalar!(dest_type, T => evaluate_bricks::<T>(&tree, &mut inputs, &mut builder))?;

    stats::append_statistics(&mut builder)?;
    builder.finalize()
}

/// Check that every input shares the structure of the first
fn ensure_mergeable(inputs: &[UvfDataset]) -> Result<()> {
    let first = &inputs[0];
    for ds in &inputs[1..] {
        let compatible = ds.components() == first.components()
            && ds.layout().overlap() == first.layout().overlap()
            && ds.layout().lod_count() == first.layout().lod_count()
            && ds.timesteps() == first.timesteps()
            && (0..first.layout().lod_count()).all(|lod| {
                ds.domain(lod) == first.domain(lod)
                    && ds.layout().brick_count(lod) == first.layout().brick_count(lod)
            });
        if !compatible {
            return Err(Error::Incompatible(format!(
                "{} does not match {}",
                ds.path().display(),
                first.path().display()
            )));
        }
    }
    Ok(())
}

fn evaluate_bricks<T: VoxelScalar>(
    tree: &Node,
    inputs: &mut [UvfDataset],
    builder: &mut UvfBuilder,
) -> Result<()> {
    let keys = inputs[0].brick_keys();
    let total = keys.len();
    let mut vars = vec![0.0f64; inputs.len()];

    for (done, key) in keys.into_iter().enumerate() {
        let mut bricks: Vec<Vec<T>> = Vec::with_capacity(inputs.len());
        for ds in inputs.iter_mut() {
            bricks.push(read_rescaled::<T>(ds, key)?);
        }

        let len = bricks[0].len();
        if bricks.iter().any(|b| b.len() != len) {
            return Err(Error::Incompatible(format!(
                "brick {:?} differs in size between inputs",
                key
            )));
        }

        let mut out: Vec<T> = Vec::with_capacity(len);
        for i in 0..len {
            for (v, brick) in vars.iter_mut().zip(bricks.iter()) {
                *v = brick[i].to_f64();
            }
            out.push(T::from_f64_clamped(tree.eval(&vars)));
        }
        builder.append_brick(key, &bytes_from_scalars(&out))?;
        info!("expression evaluation\n{}%", (100 * (done + 1)) / total);
    }
    Ok(())
}

/// Read one brick as `T`, linearly mapping the dataset's value range onto
/// the destination type's range when the stored type differs. Expansion
/// only; the destination is never narrower than the source.
fn read_rescaled<T: VoxelScalar>(ds: &mut UvfDataset, key: BrickKey) -> Result<Vec<T>> {
    let src_type = ds.data_type();
    if src_type == T::DATA_TYPE {
        return ds.read_brick_scalars::<T>(key);
    }

    let range = ds.value_range();
    let extent = range.extent();
    let bytes = ds.read_brick(key)?;

    // float destinations hold any source range as-is
    if T::DATA_TYPE.is_float() {
        let out = dispatch_scalar!(src_type, S => {
            let data: Vec<S> = scalars_from_bytes(&bytes)?;
            data.iter().map(|v| T::from_f64_clamped(v.to_f64())).collect::<Vec<T>>()
        });
        return Ok(out);
    }

    let dest_max = T::from_f64_clamped(f64::INFINITY).to_f64();
    let factor = if extent > 0.0 { dest_max / extent } else { 0.0 };
    let out = dispatch_scalar!(src_type, S => {
        let data: Vec<S> = scalars_from_bytes(&bytes)?;
        data.iter()
            .map(|v| T::from_f64_clamped((v.to_f64() - range.min) * factor))
            .collect::<Vec<T>>()
    });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{raw_to_uvf, BrickingParams};
    use crate::types::VolumeMeta;
    use tempfile::TempDir;

    fn write_volume(dir: &Path, name: &str, fill: u8, dims: [u64; 3]) -> PathBuf {
        let raw = dir.join(format!("{}.raw", name));
        std::fs::write(&raw, vec![fill; (dims[0] * dims[1] * dims[2]) as usize]).unwrap();
        let target = dir.join(format!("{}.uvf", name));
        let meta = VolumeMeta::new(DataType::U8, 1, dims);
        let params = BrickingParams {
            max_brick_size: 8,
            overlap: 2,
            ..Default::default()
        };
        raw_to_uvf(&raw, 0, &meta, &target, dir, &params).unwrap();
        target
    }

    #[test]
    fn test_sum_of_two_volumes() {
        let dir = TempDir::new().unwrap();
        let a = write_volume(dir.path(), "a", 10, [2, 2, 2]);
        let b = write_volume(dir.path(), "b", 20, [2, 2, 2]);
        let out = dir.path().join("sum.uvf");

        evaluate_expression("v0 + v1", &[a, b], &out).unwrap();

        let mut ds = UvfDataset::open(&out).unwrap();
        assert_eq!(ds.data_type(), DataType::U8);
        let voxels: Vec<u8> = ds.read_brick_scalars(BrickKey::new(0, 0)).unwrap();
        assert!(voxels.iter().all(|&v| v == 30));
    }

    #[test]
    fn test_identity_copies_input() {
        let dir = TempDir::new().unwrap();
        let a = write_volume(dir.path(), "a", 77, [3, 3, 3]);
        let out = dir.path().join("copy.uvf");

        evaluate_expression("v0", std::slice::from_ref(&a), &out).unwrap();

        let mut src = UvfDataset::open(&a).unwrap();
        let mut dst = UvfDataset::open(&out).unwrap();
        let key = BrickKey::new(0, 0);
        assert_eq!(src.read_brick(key).unwrap(), dst.read_brick(key).unwrap());
    }

    #[test]
    fn test_unmergeable_domains() {
        let dir = TempDir::new().unwrap();
        let a = write_volume(dir.path(), "a", 1, [2, 2, 2]);
        let b = write_volume(dir.path(), "b", 1, [4, 4, 4]);
        let out = dir.path().join("bad.uvf");

        assert!(matches!(
            evaluate_expression("v0 + v1", &[a, b], &out),
            Err(Error::Incompatible(_))
        ));
    }

    #[test]
    fn test_variable_out_of_range() {
        let dir = TempDir::new().unwrap();
        let a = write_volume(dir.path(), "a", 1, [2, 2, 2]);
        let out = dir.path().join("bad.uvf");
        assert!(matches!(
            evaluate_expression("v0 + v3", &[a], &out),
            Err(Error::Incompatible(_))
        ));
    }

    #[test]
    fn test_syntax_error_surfaces() {
        let dir = TempDir::new().unwrap();
        let a = write_volume(dir.path(), "a", 1, [2, 2, 2]);
        let out = dir.path().join("bad.uvf");
        assert!(matches!(
            evaluate_expression("v0 + + 1", &[a], &out),
            Err(Error::Syntax { .. })
        ));
    }
}
