//! Reading a UVF container

use super::blocks::{BlockSemantic, GeometryBlock, Histogram1D, Histogram2D, MaxMinBlock};
use super::metadata::{UvfMetadata, UvfVersion};
use super::writer::{BrickEntry, Toc};
use super::UVF_MAGIC;
use crate::error::{Error, Result};
use crate::layout::BrickLayout;
use crate::types::{scalars_from_bytes, BrickKey, DataType, ValueRange, VoxelScalar};
use crate::util::crc32;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// An opened UVF volume
pub struct UvfDataset {
    path: PathBuf,
    file: File,
    metadata: UvfMetadata,
    toc: Toc,
    brick_lookup: HashMap<BrickKey, usize>,
}

impl UvfDataset {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file =
            File::open(&path).map_err(|_| Error::Open(path.display().to_string()))?;

        let mut header = [0u8; 16];
        file.read_exact(&mut header)
            .map_err(|_| Error::Format(format!("{}: truncated header", path.display())))?;
        if &header[0..4] != UVF_MAGIC {
            return Err(Error::Format(format!(
                "{}: not a UVF file",
                path.display()
            )));
        }
        let version = UvfVersion::new(
            u16::from_le_bytes([header[4], header[5]]),
            u16::from_le_bytes([header[6], header[7]]),
        );
        if !version.is_compatible(&UvfVersion::CURRENT) {
            return Err(Error::UnsupportedVersion(version.major, version.minor));
        }
        let toc_offset = u64::from_le_bytes(header[8..16].try_into().unwrap());
        if toc_offset == 0 {
            return Err(Error::Format(format!(
                "{}: container was never finalized",
                path.display()
            )));
        }

        file.seek(SeekFrom::Start(toc_offset))?;
        let mut len_buf = [0u8; 8];
        file.read_exact(&mut len_buf)?;
        let json_len = u64::from_le_bytes(len_buf) as usize;
        let mut json = vec![0u8; json_len];
        file.read_exact(&mut json)?;
        let metadata: UvfMetadata = serde_json::from_slice(&json)?;
        let toc: Toc = bincode::deserialize_from(&mut file)?;

        let brick_lookup = toc
            .bricks
            .iter()
            .enumerate()
            .map(|(i, e)| (e.key, i))
            .collect();

        Ok(Self {
            path,
            file,
            metadata,
            toc,
            brick_lookup,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> &UvfMetadata {
        &self.metadata
    }

    pub fn layout(&self) -> &BrickLayout {
        &self.metadata.layout
    }

    pub fn data_type(&self) -> DataType {
        self.metadata.volume.data_type
    }

    pub fn components(&self) -> usize {
        self.metadata.volume.components
    }

    pub fn timesteps(&self) -> u64 {
        self.metadata.volume.timesteps
    }

    pub fn domain(&self, lod: usize) -> [u64; 3] {
        self.metadata.layout.domain(lod)
    }

    pub fn value_range(&self) -> ValueRange {
        self.metadata.value_range
    }

    /// Brick keys in stored order: LODs fine to coarse, bricks x-fastest
    pub fn brick_keys(&self) -> Vec<BrickKey> {
        let mut keys: Vec<BrickKey> = self.toc.bricks.iter().map(|e| e.key).collect();
        keys.sort_by_key(|k| (k.lod, k.index));
        keys
    }

    fn entry(&self, key: BrickKey) -> Result<BrickEntry> {
        self.brick_lookup
            .get(&key)
            .map(|&i| self.toc.bricks[i])
            .ok_or_else(|| Error::Read(format!("{}: no brick {:?}", self.path.display(), key)))
    }

    /// Decompressed native-order bytes of one brick
    pub fn read_brick(&mut self, key: BrickKey) -> Result<Vec<u8>> {
        let entry = self.entry(key)?;
        self.file.seek(SeekFrom::Start(entry.offset))?;
        let mut payload = vec![0u8; entry.len as usize];
        self.file.read_exact(&mut payload)?;
        self.metadata
            .codec
            .decompress(&payload, entry.raw_len as usize)
    }

    /// One brick as typed scalars; the stored type must match `T`
    pub fn read_brick_scalars<T: VoxelScalar>(&mut self, key: BrickKey) -> Result<Vec<T>> {
        if self.data_type() != T::DATA_TYPE {
            return Err(Error::UnsupportedType(format!(
                "volume holds {}, requested {}",
                self.data_type(),
                T::DATA_TYPE
            )));
        }
        scalars_from_bytes(&self.read_brick(key)?)
    }

    fn block_bytes(&mut self, semantic: BlockSemantic) -> Result<Option<Vec<u8>>> {
        let record = match self.toc.blocks.iter().find(|b| b.semantic == semantic) {
            Some(r) => *r,
            None => return Ok(None),
        };
        self.file.seek(SeekFrom::Start(record.offset))?;
        let mut payload = vec![0u8; record.len as usize];
        self.file.read_exact(&mut payload)?;
        Ok(Some(payload))
    }

    fn block<T: DeserializeOwned>(&mut self, semantic: BlockSemantic) -> Result<Option<T>> {
        match self.block_bytes(semantic)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn maxmin_block(&mut self) -> Result<Option<MaxMinBlock>> {
        self.block(BlockSemantic::MaxMin)
    }

    pub fn histogram_1d(&mut self) -> Result<Option<Histogram1D>> {
        self.block(BlockSemantic::Histogram1D)
    }

    pub fn histogram_2d(&mut self) -> Result<Option<Histogram2D>> {
        self.block(BlockSemantic::Histogram2D)
    }

    pub fn geometry(&mut self) -> Result<Option<GeometryBlock>> {
        self.block(BlockSemantic::Geometry)
    }

    /// Refresh the cached value range from the min/max block
    pub fn compute_range(&mut self) -> Result<ValueRange> {
        if let Some(block) = self.maxmin_block()? {
            if let Some((min, max)) = block.global_range() {
                self.metadata.value_range = ValueRange::new(min, max);
            }
        }
        Ok(self.metadata.value_range)
    }

    /// Write one LOD as a contiguous slice-major raw stream, overlap
    /// stripped, to `dest`.
    pub fn export_lod(&mut self, lod: usize, dest: impl AsRef<Path>) -> Result<()> {
        let dest = dest.as_ref();
        let domain = self.domain(lod);
        let voxel_bytes = self.metadata.volume.voxel_bytes() as u64;
        let total = domain[0] * domain[1] * domain[2] * voxel_bytes;

        let mut out = File::create(dest)
            .map_err(|e| Error::Write(format!("{}: {}", dest.display(), e)))?;
        out.set_len(total)?;

        let layout = self.metadata.layout.clone();
        for index in 0..layout.total_bricks(lod) {
            let coords = layout.index_to_coords(lod, index);
            let extent = layout.brick_extent(lod, coords);
            let data = self.read_brick(BrickKey::new(lod, index))?;
            let stored = extent.stored_dims();

            let row_bytes = (extent.core_max[0] - extent.core_min[0]) * voxel_bytes;
            for z in extent.core_min[2]..extent.core_max[2] {
                let lz = z - extent.stored_min[2];
                for y in extent.core_min[1]..extent.core_max[1] {
                    let ly = y - extent.stored_min[1];
                    let lx = extent.core_min[0] - extent.stored_min[0];
                    let src = ((lz * stored[1] + ly) * stored[0] + lx) * voxel_bytes;
                    let dst = ((z * domain[1] + y) * domain[0] + extent.core_min[0]) * voxel_bytes;
                    out.seek(SeekFrom::Start(dst))?;
                    out.write_all(&data[src as usize..(src + row_bytes) as usize])?;
                }
            }
        }
        out.flush()?;
        Ok(())
    }

    /// Re-read every brick and check its checksum
    pub fn verify(&mut self) -> Result<bool> {
        for entry in self.toc.bricks.clone() {
            let data = self.read_brick(entry.key)?;
            if crc32(&data) != entry.checksum {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BrickCodec;
    use crate::types::VolumeMeta;
    use crate::uvf::UvfBuilder;
    use tempfile::TempDir;

    fn write_single_brick_volume(path: &Path, data: &[u8]) {
        let volume = VolumeMeta::new(DataType::U8, 1, [4, 4, 4]);
        let layout = BrickLayout::new([4, 4, 4], 12, 2).unwrap();
        let md = UvfMetadata::new(volume, layout).with_codec(BrickCodec::Deflate);
        let mut builder = UvfBuilder::create(path, md).unwrap();
        builder.append_brick(BrickKey::new(0, 0), data).unwrap();
        builder.finalize().unwrap();
    }

    #[test]
    fn test_open_and_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v.uvf");
        let data: Vec<u8> = (0..64).collect();
        write_single_brick_volume(&path, &data);

        let mut ds = UvfDataset::open(&path).unwrap();
        assert_eq!(ds.data_type(), DataType::U8);
        assert_eq!(ds.domain(0), [4, 4, 4]);
        assert_eq!(ds.read_brick(BrickKey::new(0, 0)).unwrap(), data);
        assert!(ds.verify().unwrap());
    }

    #[test]
    fn test_export_strips_nothing_for_single_brick() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v.uvf");
        let data: Vec<u8> = (0..64).collect();
        write_single_brick_volume(&path, &data);

        let raw = dir.path().join("v.raw");
        let mut ds = UvfDataset::open(&path).unwrap();
        ds.export_lod(0, &raw).unwrap();
        assert_eq!(std::fs::read(&raw).unwrap(), data);
    }

    #[test]
    fn test_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("not.uvf");
        std::fs::write(&path, b"garbage that is long enough....").unwrap();
        assert!(matches!(
            UvfDataset::open(&path),
            Err(Error::Format(_))
        ));
    }
}
