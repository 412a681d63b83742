//! Raw stream to bricked multi-LOD container
//!
//! This is the back half of every import: a slice-major raw stream plus its
//! [`VolumeMeta`] goes in, a finalized UVF comes out. The stream is first
//! normalized (byte order, optional 8-bit quantization), then the LOD chain
//! is materialized bottom-up as temporary raw files, each level bricked and
//! appended, and finally the statistics blocks are computed. Temporary
//! files are removed on every exit path.

use crate::codec::BrickCodec;
use crate::error::{Error, Result};
use crate::layout::BrickLayout;
use crate::stats;
use crate::types::{
    bytes_from_scalars, dispatch_scalar, scalars_from_bytes, BrickKey, DataType, VolumeMeta,
    VoxelScalar,
};
use crate::util::{file_name, format_bytes};
use crate::uvf::{UvfBuilder, UvfMetadata};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Bricking parameters for one conversion
#[derive(Debug, Clone, Copy)]
pub struct BrickingParams {
    pub max_brick_size: u64,
    pub overlap: u64,
    pub quantize8: bool,
    pub codec: BrickCodec,
}

impl Default for BrickingParams {
    fn default() -> Self {
        Self {
            max_brick_size: 256,
            overlap: 2,
            quantize8: false,
            codec: BrickCodec::default(),
        }
    }
}

/// Removes its files on drop; success and failure paths share cleanup.
pub(crate) struct TempGuard {
    files: Vec<PathBuf>,
}

impl TempGuard {
    pub fn new() -> Self {
        Self { files: Vec::new() }
    }

    pub fn add(&mut self, path: PathBuf) {
        self.files.push(path);
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        for path in &self.files {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!("unable to remove temp file {}: {}", path.display(), e);
                }
            }
        }
    }
}

/// Convert a raw stream into a bricked multi-LOD UVF at `target`.
pub fn raw_to_uvf(
    raw: &Path,
    header_skip: u64,
    meta: &VolumeMeta,
    target: &Path,
    temp_dir: &Path,
    params: &BrickingParams,
) -> Result<()> {
    let mut guard = TempGuard::new();
    build(raw, header_skip, meta, target, temp_dir, params, &mut guard)
}

fn build(
    raw: &Path,
    header_skip: u64,
    meta: &VolumeMeta,
    target: &Path,
    temp_dir: &Path,
    params: &BrickingParams,
    guard: &mut TempGuard,
) -> Result<()> {
    let src_len = std::fs::metadata(raw)
        .map_err(|_| Error::Open(raw.display().to_string()))?
        .len();
    if src_len < header_skip + meta.raw_len() {
        return Err(Error::Read(format!(
            "{}: {} bytes, but {}+{} required",
            raw.display(),
            src_len,
            header_skip,
            meta.raw_len()
        )));
    }

    info!(
        "bricking {} ({} {}x{}x{}, {} component(s), {})",
        raw.display(),
        meta.data_type,
        meta.domain[0],
        meta.domain[1],
        meta.domain[2],
        meta.components,
        format_bytes(meta.raw_len())
    );

    // Normalize byte order and optionally quantize before bricking.
    let needs_swap = meta.swap_endian && meta.data_type.size_in_bytes() > 1;
    let needs_quant = params.quantize8 && meta.data_type.bit_width() > 8;
    let (lod0_path, lod0_skip, norm_meta) = if needs_swap || needs_quant {
        let norm = temp_dir.join(format!("{}.norm~", file_name(target)));
        guard.add(norm.clone());
        let norm_meta = normalize_stream(raw, header_skip, meta, &norm, needs_swap, needs_quant)?;
        (norm, 0u64, norm_meta)
    } else {
        let mut m = meta.clone();
        m.swap_endian = false;
        (raw.to_path_buf(), header_skip, m)
    };

    let layout = BrickLayout::new(norm_meta.domain, params.max_brick_size, params.overlap)?;
    let lod_count = layout.lod_count();
    info!("{}", layout.summary());

    let metadata = UvfMetadata::new(norm_meta.clone(), layout.clone()).with_codec(params.codec);
    let mut builder = UvfBuilder::create(target, metadata)?;

    // Materialize the LOD chain as raw files, finest first.
    let mut lod_files: Vec<(PathBuf, u64)> = vec![(lod0_path, lod0_skip)];
    for lod in 1..lod_count {
        let dst = temp_dir.join(format!("{}.lod{}~", file_name(target), lod));
        guard.add(dst.clone());
        let (ref src, src_skip) = lod_files[lod - 1];
        downsample_raw(
            src,
            src_skip,
            layout.domain(lod - 1),
            &dst,
            layout.domain(lod),
            norm_meta.data_type,
            norm_meta.components,
        )?;
        lod_files.push((dst, 0));
    }

    let voxel_bytes = norm_meta.voxel_bytes();
    for lod in 0..lod_count {
        let (ref path, skip) = lod_files[lod];
        let mut file =
            File::open(path).map_err(|_| Error::Open(path.display().to_string()))?;
        let domain = layout.domain(lod);
        let total = layout.total_bricks(lod);
        for index in 0..total {
            let coords = layout.index_to_coords(lod, index);
            let extent = layout.brick_extent(lod, coords);
            let data = read_box(
                &mut file,
                skip,
                domain,
                voxel_bytes,
                extent.stored_min,
                extent.stored_max,
            )?;
            builder.append_brick(BrickKey::new(lod, index), &data)?;
        }
        info!(
            "bricked LOD {}/{} ({} bricks)\n{}%",
            lod + 1,
            lod_count,
            total,
            (100 * (lod + 1)) / lod_count
        );
    }

    stats::append_statistics(&mut builder)?;
    builder.finalize()
}

/// Rewrite a raw stream in host byte order, optionally quantized to u8.
/// Returns the metadata of the rewritten stream.
fn normalize_stream(
    src: &Path,
    skip: u64,
    meta: &VolumeMeta,
    dest: &Path,
    swap: bool,
    quantize: bool,
) -> Result<VolumeMeta> {
    let mut out_meta = meta.clone();
    out_meta.swap_endian = false;

    if !quantize {
        stream_scalars(src, skip, meta, dest, swap)?;
        return Ok(out_meta);
    }

    // two passes: scan the range, then map to u8
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    scan_scalars(src, skip, meta, swap, |v| {
        min = min.min(v);
        max = max.max(v);
    })?;
    let extent = if max > min { max - min } else { 1.0 };
    info!("quantizing range [{}, {}] to 8 bits", min, max);

    let data_type = meta.data_type;
    let scalar_count = meta.voxel_count() * meta.components as u64;
    let mut reader = open_at(src, skip)?;
    let mut writer = BufWriter::new(
        File::create(dest).map_err(|e| Error::Write(format!("{}: {}", dest.display(), e)))?,
    );
    dispatch_scalar!(data_type, T => {
        let size = std::mem::size_of::<T>();
        let mut buf = vec![0u8; size];
        for _ in 0..scalar_count {
            reader.read_exact(&mut buf)?;
            let mut v = <T as VoxelScalar>::from_ne_bytes(&buf);
            if swap {
                v = v.swap_order();
            }
            let q = (((v.to_f64() - min) / extent) * 255.0).round().clamp(0.0, 255.0) as u8;
            writer.write_all(&[q])?;
        }
    });
    writer.flush()?;

    out_meta.data_type = DataType::U8;
    Ok(out_meta)
}

fn open_at(path: &Path, skip: u64) -> Result<BufReader<File>> {
    let mut file = File::open(path).map_err(|_| Error::Open(path.display().to_string()))?;
    file.seek(SeekFrom::Start(skip))?;
    Ok(BufReader::new(file))
}

/// Stream every scalar of a raw file through `visit`
pub(crate) fn scan_scalars(
    src: &Path,
    skip: u64,
    meta: &VolumeMeta,
    swap: bool,
    mut visit: impl FnMut(f64),
) -> Result<()> {
    let scalar_count = meta.voxel_count() * meta.components as u64;
    let mut reader = open_at(src, skip)?;
    dispatch_scalar!(meta.data_type, T => {
        let size = std::mem::size_of::<T>();
        let mut buf = vec![0u8; size];
        for _ in 0..scalar_count {
            reader.read_exact(&mut buf)?;
            let mut v = <T as VoxelScalar>::from_ne_bytes(&buf);
            if swap {
                v = v.swap_order();
            }
            visit(v.to_f64());
        }
    });
    Ok(())
}

/// Copy a raw stream scalar-by-scalar, applying the byte swap
fn stream_scalars(src: &Path, skip: u64, meta: &VolumeMeta, dest: &Path, swap: bool) -> Result<()> {
    let scalar_count = meta.voxel_count() * meta.components as u64;
    let mut reader = open_at(src, skip)?;
    let mut writer = BufWriter::new(
        File::create(dest).map_err(|e| Error::Write(format!("{}: {}", dest.display(), e)))?,
    );
    dispatch_scalar!(meta.data_type, T => {
        let size = std::mem::size_of::<T>();
        let mut buf = vec![0u8; size];
        for _ in 0..scalar_count {
            reader.read_exact(&mut buf)?;
            let mut v = <T as VoxelScalar>::from_ne_bytes(&buf);
            if swap {
                v = v.swap_order();
            }
            v.write_ne_bytes(&mut buf);
            writer.write_all(&buf)?;
        }
    });
    writer.flush()?;
    Ok(())
}

/// Read an axis-aligned box `[min, max)` out of a slice-major raw file
pub(crate) fn read_box(
    file: &mut File,
    base: u64,
    domain: [u64; 3],
    voxel_bytes: usize,
    min: [u64; 3],
    max: [u64; 3],
) -> Result<Vec<u8>> {
    let vb = voxel_bytes as u64;
    let dims = [max[0] - min[0], max[1] - min[1], max[2] - min[2]];
    let row_bytes = (dims[0] * vb) as usize;
    let mut out = vec![0u8; (dims[0] * dims[1] * dims[2] * vb) as usize];

    let mut cursor = 0usize;
    for z in min[2]..max[2] {
        for y in min[1]..max[1] {
            let offset = base + ((z * domain[1] + y) * domain[0] + min[0]) * vb;
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut out[cursor..cursor + row_bytes])?;
            cursor += row_bytes;
        }
    }
    Ok(out)
}

/// Downsample one LOD into the next by averaging 2x2x2 neighborhoods,
/// streaming two source slices at a time.
fn downsample_raw(
    src: &Path,
    src_skip: u64,
    src_domain: [u64; 3],
    dest: &Path,
    dst_domain: [u64; 3],
    data_type: DataType,
    components: usize,
) -> Result<()> {
    let vb = (data_type.size_in_bytes() * components) as u64;
    let slice_bytes = (src_domain[0] * src_domain[1] * vb) as usize;
    let mut src_file =
        File::open(src).map_err(|_| Error::Open(src.display().to_string()))?;
    let mut writer = BufWriter::new(
        File::create(dest).map_err(|e| Error::Write(format!("{}: {}", dest.display(), e)))?,
    );

    let mut slice_lo = vec![0u8; slice_bytes];
    let mut slice_hi = vec![0u8; slice_bytes];

    for dz in 0..dst_domain[2] {
        let z0 = (dz * 2).min(src_domain[2] - 1);
        let z1 = (dz * 2 + 1).min(src_domain[2] - 1);
        read_slice(&mut src_file, src_skip, slice_bytes, z0, &mut slice_lo)?;
        read_slice(&mut src_file, src_skip, slice_bytes, z1, &mut slice_hi)?;

        dispatch_scalar!(data_type, T => {
            let lo: Vec<T> = scalars_from_bytes(&slice_lo)?;
            let hi: Vec<T> = scalars_from_bytes(&slice_hi)?;
            let mut dst_slice: Vec<T> =
                Vec::with_capacity((dst_domain[0] * dst_domain[1]) as usize * components);
            for dy in 0..dst_domain[1] {
                let y0 = (dy * 2).min(src_domain[1] - 1);
                let y1 = (dy * 2 + 1).min(src_domain[1] - 1);
                for dx in 0..dst_domain[0] {
                    let x0 = (dx * 2).min(src_domain[0] - 1);
                    let x1 = (dx * 2 + 1).min(src_domain[0] - 1);
                    for c in 0..components {
                        let mut sum = 0.0f64;
                        for (slice, y, x) in [
                            (&lo, y0, x0),
                            (&lo, y0, x1),
                            (&lo, y1, x0),
                            (&lo, y1, x1),
                            (&hi, y0, x0),
                            (&hi, y0, x1),
                            (&hi, y1, x0),
                            (&hi, y1, x1),
                        ] {
                            let idx = ((y * src_domain[0] + x) as usize) * components + c;
                            sum += slice[idx].to_f64();
                        }
                        dst_slice.push(T::from_f64_clamped(sum / 8.0));
                    }
                }
            }
            writer.write_all(&bytes_from_scalars(&dst_slice))?;
        });
    }
    writer.flush()?;
    Ok(())
}

fn read_slice(
    file: &mut File,
    base: u64,
    slice_bytes: usize,
    z: u64,
    buf: &mut [u8],
) -> Result<()> {
    file.seek(SeekFrom::Start(base + z * slice_bytes as u64))?;
    file.read_exact(buf)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uvf::UvfDataset;
    use tempfile::TempDir;

    fn write_raw(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_round_trip_single_brick() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..64).collect();
        let raw = write_raw(dir.path(), "v.raw", &data);
        let target = dir.path().join("v.uvf");

        let meta = VolumeMeta::new(DataType::U8, 1, [4, 4, 4]);
        let params = BrickingParams {
            max_brick_size: 12,
            overlap: 2,
            ..Default::default()
        };
        raw_to_uvf(&raw, 0, &meta, &target, dir.path(), &params).unwrap();

        let mut ds = UvfDataset::open(&target).unwrap();
        assert_eq!(ds.layout().lod_count(), 1);
        let out = dir.path().join("back.raw");
        ds.export_lod(0, &out).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), data);
        assert_eq!(ds.value_range().min, 0.0);
        assert_eq!(ds.value_range().max, 63.0);
    }

    #[test]
    fn test_endian_normalization() {
        let dir = TempDir::new().unwrap();
        // one u16 voxel, stored opposite to host order
        let raw = write_raw(dir.path(), "v.raw", &[0x12, 0x34]);
        let target = dir.path().join("v.uvf");

        let mut meta = VolumeMeta::new(DataType::U16, 1, [1, 1, 1]);
        meta.swap_endian = true;
        let params = BrickingParams {
            max_brick_size: 8,
            overlap: 2,
            ..Default::default()
        };
        raw_to_uvf(&raw, 0, &meta, &target, dir.path(), &params).unwrap();

        let mut ds = UvfDataset::open(&target).unwrap();
        let voxels: Vec<u16> = ds.read_brick_scalars(BrickKey::new(0, 0)).unwrap();
        let expected = u16::from_ne_bytes([0x12, 0x34]).swap_bytes();
        assert_eq!(voxels, vec![expected]);
    }

    #[test]
    fn test_quantize8() {
        let dir = TempDir::new().unwrap();
        let values: Vec<u16> = vec![0, 100, 200, 400, 800, 1000, 500, 1000];
        let raw = write_raw(dir.path(), "v.raw", &bytes_from_scalars(&values));
        let target = dir.path().join("v.uvf");

        let meta = VolumeMeta::new(DataType::U16, 1, [2, 2, 2]);
        let params = BrickingParams {
            max_brick_size: 8,
            overlap: 2,
            quantize8: true,
            ..Default::default()
        };
        raw_to_uvf(&raw, 0, &meta, &target, dir.path(), &params).unwrap();

        let mut ds = UvfDataset::open(&target).unwrap();
        assert_eq!(ds.data_type(), DataType::U8);
        let voxels: Vec<u8> = ds.read_brick_scalars(BrickKey::new(0, 0)).unwrap();
        assert_eq!(voxels[0], 0);
        assert_eq!(voxels[5], 255);
    }

    #[test]
    fn test_short_stream_rejected() {
        let dir = TempDir::new().unwrap();
        let raw = write_raw(dir.path(), "v.raw", &[0u8; 10]);
        let target = dir.path().join("v.uvf");
        let meta = VolumeMeta::new(DataType::U8, 1, [4, 4, 4]);
        let err = raw_to_uvf(&raw, 0, &meta, &target, dir.path(), &BrickingParams::default());
        assert!(matches!(err, Err(Error::Read(_))));
    }

    #[test]
    fn test_multi_lod_chain() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..4096).map(|v| (v % 253) as u8).collect();
        let raw = write_raw(dir.path(), "v.raw", &data);
        let target = dir.path().join("v.uvf");

        let meta = VolumeMeta::new(DataType::U8, 1, [16, 16, 16]);
        let params = BrickingParams {
            max_brick_size: 12,
            overlap: 2,
            ..Default::default()
        };
        raw_to_uvf(&raw, 0, &meta, &target, dir.path(), &params).unwrap();

        let mut ds = UvfDataset::open(&target).unwrap();
        assert!(ds.layout().lod_count() >= 2);
        // coarsest level fits one brick
        let last = ds.layout().lod_count() - 1;
        assert_eq!(ds.layout().total_bricks(last), 1);
        // temp LOD files are gone
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains('~'))
            .collect();
        assert!(leftovers.is_empty(), "temp files left: {:?}", leftovers);
    }
}
