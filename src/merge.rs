//! N-way merge of co-dimensional raw streams
//!
//! Every voxel position is combined across all aligned inputs, each first
//! mapped through its own scale and bias. Streams are processed in
//! brick-sized windows so the whole volume never sits in memory. A partial
//! write aborts the merge and removes the output.

use crate::error::{Error, Result};
use crate::types::{bytes_from_scalars, dispatch_scalar, VolumeMeta, VoxelScalar};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// One merge input: a raw intermediate plus its transfer function
#[derive(Debug, Clone)]
pub struct MergeInput {
    pub path: PathBuf,
    pub header_skip: u64,
    pub scale: f64,
    pub bias: f64,
    /// Honored by the facade once the merge is over
    pub delete: bool,
}

/// Merge all inputs into a single raw stream at `dest`. `use_max` selects
/// the maximum across inputs, otherwise contributions are summed.
pub fn merge_raw_streams(
    inputs: &[MergeInput],
    meta: &VolumeMeta,
    dest: &Path,
    use_max: bool,
    window_voxels: usize,
) -> Result<()> {
    if inputs.is_empty() {
        return Err(Error::Incompatible("no merge inputs".into()));
    }
    if meta.data_type.is_float() && !meta.data_type.is_signed() {
        return Err(Error::UnsupportedType("unsigned float data".into()));
    }

    let result = merge_inner(inputs, meta, dest, use_max, window_voxels);
    if result.is_err() && dest.exists() {
        if let Err(e) = std::fs::remove_file(dest) {
            tracing::warn!("unable to remove {}: {}", dest.display(), e);
        }
    }
    result
}

fn merge_inner(
    inputs: &[MergeInput],
    meta: &VolumeMeta,
    dest: &Path,
    use_max: bool,
    window_voxels: usize,
) -> Result<()> {
    info!(
        "merging {} streams into {} ({} mode)",
        inputs.len(),
        dest.display(),
        if use_max { "max" } else { "additive" }
    );

    let mut readers: Vec<BufReader<File>> = Vec::with_capacity(inputs.len());
    for input in inputs {
        let mut file = File::open(&input.path)
            .map_err(|_| Error::Open(input.path.display().to_string()))?;
        file.seek(SeekFrom::Start(input.header_skip))?;
        readers.push(BufReader::new(file));
    }

    let mut writer = BufWriter::new(
        File::create(dest).map_err(|e| Error::Write(format!("{}: {}", dest.display(), e)))?,
    );

    let total_scalars = meta.voxel_count() * meta.components as u64;
    let window_scalars = (window_voxels * meta.components).max(1) as u64;

    dispatch_scalar!(meta.data_type, T => {
        let size = std::mem::size_of::<T>();
        let mut remaining = total_scalars;
        let mut done = 0u64;
        let mut in_buf = vec![0u8; window_scalars as usize * size];
        let mut acc: Vec<f64> = Vec::new();
        while remaining > 0 {
            let chunk = window_scalars.min(remaining) as usize;
            acc.clear();
            acc.resize(chunk, if use_max { f64::NEG_INFINITY } else { 0.0 });

            for (reader, input) in readers.iter_mut().zip(inputs.iter()) {
                let bytes = &mut in_buf[..chunk * size];
                reader.read_exact(bytes).map_err(|e| {
                    Error::Read(format!("{}: {}", input.path.display(), e))
                })?;
                for (i, value_bytes) in bytes.chunks_exact(size).enumerate() {
                    let v = <T as VoxelScalar>::from_ne_bytes(value_bytes).to_f64() * input.scale + input.bias;
                    if use_max {
                        acc[i] = acc[i].max(v);
                    } else {
                        acc[i] += v;
                    }
                }
            }

            let out: Vec<T> = acc.iter().map(|&v| T::from_f64_clamped(v)).collect();
            writer.write_all(&bytes_from_scalars(&out))?;
            remaining -= chunk as u64;
            done += chunk as u64;
            info!(
                "merging streams\n{}%",
                (100 * done) / total_scalars
            );
        }
    });
    writer.flush()?;
    Ok(())
}

/// Check that a set of volume descriptions can be merged: identical type,
/// component count, endianness handling, and domain size. Aspect
/// differences are reported by the caller as a warning, never an error.
pub fn check_mergeable(metas: &[VolumeMeta]) -> Result<()> {
    let first = match metas.first() {
        Some(m) => m,
        None => return Err(Error::Incompatible("no inputs".into())),
    };
    for (i, m) in metas.iter().enumerate().skip(1) {
        if m.data_type.bit_width() != first.data_type.bit_width() {
            return Err(Error::Incompatible(format!(
                "input {}: mismatched bit widths",
                i
            )));
        }
        if m.components != first.components {
            return Err(Error::Incompatible(format!(
                "input {}: different number of components",
                i
            )));
        }
        if m.swap_endian != first.swap_endian {
            return Err(Error::Incompatible(format!(
                "input {}: mismatched endianness",
                i
            )));
        }
        if m.data_type.is_signed() != first.data_type.is_signed() {
            return Err(Error::Incompatible(format!(
                "input {}: signedness differences",
                i
            )));
        }
        if m.data_type.is_float() != first.data_type.is_float() {
            return Err(Error::Incompatible(format!(
                "input {}: some data float, other non-float",
                i
            )));
        }
        if m.domain != first.domain {
            return Err(Error::Incompatible(format!(
                "input {}: different volume sizes",
                i
            )));
        }
    }
    Ok(())
}
