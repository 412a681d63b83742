//! Writing a UVF container

use super::blocks::BlockSemantic;
use super::metadata::UvfMetadata;
use super::UVF_MAGIC;
use crate::error::{Error, Result};
use crate::types::BrickKey;
use crate::util::crc32;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Location of one compressed brick payload
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct BrickEntry {
    pub key: BrickKey,
    pub offset: u64,
    pub len: u64,
    pub raw_len: u64,
    pub checksum: u32,
}

/// Location of one auxiliary data block
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct BlockRecord {
    pub semantic: BlockSemantic,
    pub offset: u64,
    pub len: u64,
}

/// Trailing table of contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Toc {
    pub bricks: Vec<BrickEntry>,
    pub blocks: Vec<BlockRecord>,
}

/// Incrementally builds a UVF file: bricks first, then auxiliary blocks,
/// then the table of contents on `finalize`.
pub struct UvfBuilder {
    path: PathBuf,
    file: File,
    metadata: UvfMetadata,
    toc: Toc,
    cursor: u64,
}

impl UvfBuilder {
    pub fn create(path: impl AsRef<Path>, metadata: UvfMetadata) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::Write(format!("{}: {}", path.display(), e)))?;

        file.write_all(UVF_MAGIC)?;
        file.write_all(&metadata.version.major.to_le_bytes())?;
        file.write_all(&metadata.version.minor.to_le_bytes())?;
        // TOC offset, patched on finalize
        file.write_all(&0u64.to_le_bytes())?;

        Ok(Self {
            path,
            file,
            metadata,
            toc: Toc::default(),
            cursor: 16,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> &UvfMetadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut UvfMetadata {
        &mut self.metadata
    }

    /// Append one brick of native-order voxel data. The buffer must cover
    /// the brick's stored extent exactly.
    pub fn append_brick(&mut self, key: BrickKey, data: &[u8]) -> Result<()> {
        let layout = &self.metadata.layout;
        let coords = layout.index_to_coords(key.lod, key.index);
        let expected = layout.brick_extent(key.lod, coords).stored_voxels()
            * self.metadata.volume.voxel_bytes() as u64;
        if data.len() as u64 != expected {
            return Err(Error::Write(format!(
                "brick {:?} payload is {} bytes, layout expects {}",
                key,
                data.len(),
                expected
            )));
        }

        let payload = self.metadata.codec.compress(data)?;
        self.file.seek(SeekFrom::Start(self.cursor))?;
        self.file.write_all(&payload)?;
        self.toc.bricks.push(BrickEntry {
            key,
            offset: self.cursor,
            len: payload.len() as u64,
            raw_len: data.len() as u64,
            checksum: crc32(data),
        });
        self.cursor += payload.len() as u64;
        Ok(())
    }

    /// Read back a brick written earlier, e.g. for statistics passes
    pub fn read_brick(&mut self, key: BrickKey) -> Result<Vec<u8>> {
        let entry = self
            .toc
            .bricks
            .iter()
            .find(|e| e.key == key)
            .copied()
            .ok_or_else(|| Error::Read(format!("brick {:?} not yet written", key)))?;
        self.file.seek(SeekFrom::Start(entry.offset))?;
        let mut payload = vec![0u8; entry.len as usize];
        self.file.read_exact(&mut payload)?;
        self.metadata
            .codec
            .decompress(&payload, entry.raw_len as usize)
    }

    /// Append an auxiliary data block (min/max, histograms, geometry)
    pub fn append_block<T: Serialize>(&mut self, semantic: BlockSemantic, block: &T) -> Result<()> {
        let payload = bincode::serialize(block)?;
        self.file.seek(SeekFrom::Start(self.cursor))?;
        self.file.write_all(&payload)?;
        self.toc.blocks.push(BlockRecord {
            semantic,
            offset: self.cursor,
            len: payload.len() as u64,
        });
        self.cursor += payload.len() as u64;
        Ok(())
    }

    /// Write the metadata and table of contents and close the file
    pub fn finalize(mut self) -> Result<()> {
        self.metadata.touch();
        let toc_offset = self.cursor;

        self.file.seek(SeekFrom::Start(toc_offset))?;
        let json = serde_json::to_vec(&self.metadata)?;
        self.file.write_all(&(json.len() as u64).to_le_bytes())?;
        self.file.write_all(&json)?;
        let toc = bincode::serialize(&self.toc)?;
        self.file.write_all(&toc)?;

        self.file.seek(SeekFrom::Start(8))?;
        self.file.write_all(&toc_offset.to_le_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::BrickLayout;
    use crate::types::{DataType, VolumeMeta};
    use tempfile::TempDir;

    #[test]
    fn test_write_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vol.uvf");

        let volume = VolumeMeta::new(DataType::U8, 1, [8, 8, 8]);
        let layout = BrickLayout::new([8, 8, 8], 16, 2).unwrap();
        let md = UvfMetadata::new(volume, layout);

        let mut builder = UvfBuilder::create(&path, md).unwrap();
        let data: Vec<u8> = (0..512u32).map(|v| (v % 251) as u8).collect();
        let key = BrickKey::new(0, 0);
        builder.append_brick(key, &data).unwrap();
        assert_eq!(builder.read_brick(key).unwrap(), data);
        builder.finalize().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_rejects_short_brick() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vol.uvf");

        let volume = VolumeMeta::new(DataType::U8, 1, [8, 8, 8]);
        let layout = BrickLayout::new([8, 8, 8], 16, 2).unwrap();
        let mut builder = UvfBuilder::create(&path, UvfMetadata::new(volume, layout)).unwrap();
        assert!(builder
            .append_brick(BrickKey::new(0, 0), &[0u8; 17])
            .is_err());
    }
}
