//! Built-in volume format converters

mod analyze;
mod bov;
mod nrrd;
mod qvis;
mod raw;

pub use analyze::AnalyzeConverter;
pub use bov::BovConverter;
pub use nrrd::NrrdConverter;
pub use qvis::QvisConverter;
pub use raw::RawConverter;

use crate::builder;
use crate::error::{Error, Result};
use crate::types::{dispatch_scalar, DataType, VolumeMeta, VoxelScalar};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Copy a raw payload into a native file body, normalizing byte order and
/// optionally quantizing to 8 bits. Returns the metadata of the written
/// payload (the data type changes under quantization).
pub(crate) fn copy_payload<W: Write>(
    raw: &Path,
    header_skip: u64,
    meta: &VolumeMeta,
    out: &mut W,
    quantize8: bool,
) -> Result<VolumeMeta> {
    let needs_swap = meta.swap_endian && meta.data_type.size_in_bytes() > 1;
    let needs_quant = quantize8 && meta.data_type.bit_width() > 8;

    if !needs_swap && !needs_quant {
        let mut reader = open_payload(raw, header_skip)?;
        let mut remaining = meta.raw_len();
        let mut buf = vec![0u8; 1 << 16];
        while remaining > 0 {
            let chunk = buf.len().min(remaining as usize);
            reader.read_exact(&mut buf[..chunk])?;
            out.write_all(&buf[..chunk])?;
            remaining -= chunk as u64;
        }
        let mut m = meta.clone();
        m.swap_endian = false;
        return Ok(m);
    }

    if !needs_quant {
        // swap only
        let scalar_count = meta.voxel_count() * meta.components as u64;
        let mut reader = open_payload(raw, header_skip)?;
        dispatch_scalar!(meta.data_type, T => {
            let size = std::mem::size_of::<T>();
            let mut buf = vec![0u8; size];
            for _ in 0..scalar_count {
                reader.read_exact(&mut buf)?;
                let v = <T as VoxelScalar>::from_ne_bytes(&buf).swap_order();
                v.write_ne_bytes(&mut buf);
                out.write_all(&buf)?;
            }
        });
        let mut m = meta.clone();
        m.swap_endian = false;
        return Ok(m);
    }

    // quantize: scan the range first, then map each scalar to u8
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    builder::scan_scalars(raw, header_skip, meta, needs_swap, |v| {
        min = min.min(v);
        max = max.max(v);
    })?;
    let extent = if max > min { max - min } else { 1.0 };

    let scalar_count = meta.voxel_count() * meta.components as u64;
    let mut reader = open_payload(raw, header_skip)?;
    dispatch_scalar!(meta.data_type, T => {
        let size = std::mem::size_of::<T>();
        let mut buf = vec![0u8; size];
        for _ in 0..scalar_count {
            reader.read_exact(&mut buf)?;
            let mut v = <T as VoxelScalar>::from_ne_bytes(&buf);
            if needs_swap {
                v = v.swap_order();
            }
            let q = (((v.to_f64() - min) / extent) * 255.0).round().clamp(0.0, 255.0) as u8;
            out.write_all(&[q])?;
        }
    });

    let mut m = meta.clone();
    m.swap_endian = false;
    m.data_type = DataType::U8;
    Ok(m)
}

fn open_payload(path: &Path, skip: u64) -> Result<BufReader<File>> {
    let mut file = File::open(path).map_err(|_| Error::Open(path.display().to_string()))?;
    file.seek(SeekFrom::Start(skip))?;
    Ok(BufReader::new(file))
}
