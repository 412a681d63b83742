//! Headerless raw fallback converter
//!
//! Accepts anything, which makes it the natural candidate for the *final*
//! converter slot: it is only consulted after every sniffer has declined.
//! Since a bare stream carries no geometry, imports require the caller to
//! supply the volume metadata up front.

use super::copy_payload;
use crate::converter::{RawSource, VolumeConverter};
use crate::error::{Error, Result};
use crate::types::VolumeMeta;
use std::fs::File;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;

#[derive(Default)]
pub struct RawConverter {
    meta: Option<VolumeMeta>,
}

impl RawConverter {
    pub fn new() -> Self {
        Self { meta: None }
    }

    /// A raw converter that imports streams as the given volume layout
    pub fn with_meta(meta: VolumeMeta) -> Self {
        Self { meta: Some(meta) }
    }
}

impl VolumeConverter for RawConverter {
    fn description(&self) -> &str {
        "Raw volume stream"
    }

    fn extensions(&self) -> &[&str] {
        &["raw"]
    }

    fn can_export(&self) -> bool {
        true
    }

    fn can_read(&self, _path: &Path, _first_block: &[u8]) -> bool {
        true
    }

    fn convert_to_raw(&self, src: &Path, _temp_dir: &Path, no_ui: bool) -> Result<RawSource> {
        let meta = match &self.meta {
            Some(meta) => meta.clone(),
            None if no_ui => {
                return Err(Error::Read(format!(
                    "{}: raw import requires explicit volume metadata",
                    src.display()
                )))
            }
            None => {
                return Err(Error::Read(format!(
                    "{}: no metadata prompt available for raw import",
                    src.display()
                )))
            }
        };
        if !src.exists() {
            return Err(Error::Open(src.display().to_string()));
        }
        Ok(RawSource {
            path: src.to_path_buf(),
            header_skip: 0,
            delete: false,
            meta,
        })
    }

    fn convert_to_native(
        &self,
        raw: &Path,
        header_skip: u64,
        meta: &VolumeMeta,
        target: &Path,
        _no_ui: bool,
        quantize8: bool,
    ) -> Result<()> {
        let mut out = BufWriter::new(
            File::create(target)
                .map_err(|e| Error::Write(format!("{}: {}", target.display(), e)))?,
        );
        copy_payload(raw, header_skip, meta, &mut out, quantize8)?;
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;
    use tempfile::TempDir;

    #[test]
    fn test_requires_metadata() {
        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("v.raw");
        std::fs::write(&raw, vec![0u8; 8]).unwrap();
        assert!(RawConverter::new()
            .convert_to_raw(&raw, dir.path(), true)
            .is_err());
    }

    #[test]
    fn test_with_meta_passes_through() {
        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("v.raw");
        std::fs::write(&raw, vec![3u8; 8]).unwrap();

        let meta = VolumeMeta::new(DataType::U8, 1, [2, 2, 2]);
        let conv = RawConverter::with_meta(meta);
        let source = conv.convert_to_raw(&raw, dir.path(), true).unwrap();
        assert_eq!(source.path, raw);
        assert!(!source.delete);
        assert_eq!(source.header_skip, 0);
    }

    #[test]
    fn test_native_export_copies() {
        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("v.raw");
        let data: Vec<u8> = (0..8).collect();
        std::fs::write(&raw, &data).unwrap();

        let meta = VolumeMeta::new(DataType::U8, 1, [2, 2, 2]);
        let target = dir.path().join("out.raw");
        RawConverter::new()
            .convert_to_native(&raw, 0, &meta, &target, true, false)
            .unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), data);
    }
}
