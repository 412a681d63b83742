//! The volume converter plugin contract
//!
//! Converters are capability records kept in a plain registry; dispatch is
//! by content sniffing or extension match, never by concrete type. A
//! converter that accepts a file may still fail mid-conversion, in which
//! case the pipeline moves on to the next acceptor.

use crate::builder::{self, BrickingParams};
use crate::error::{Error, Result};
use crate::types::{ValueRange, VolumeMeta};
use std::path::{Path, PathBuf};
use tracing::info;

/// Value class reported by `analyze`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueClass {
    Float,
    Signed,
    Unsigned,
}

/// Range and layout summary of a dataset, without converting it
#[derive(Debug, Clone)]
pub struct RangeInfo {
    pub value_class: ValueClass,
    pub range: ValueRange,
    pub domain: [u64; 3],
    pub aspect: [f32; 3],
    pub component_size: usize,
}

/// A raw intermediate produced by `convert_to_raw`. The `delete` flag is
/// honored by whoever consumes the intermediate; the converter that
/// produced it never removes it on its own.
#[derive(Debug, Clone)]
pub struct RawSource {
    pub path: PathBuf,
    pub header_skip: u64,
    pub delete: bool,
    pub meta: VolumeMeta,
}

impl RawSource {
    /// Remove the intermediate if its producer flagged it as disposable
    pub fn cleanup(&self) {
        if self.delete && self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!("unable to remove temp file {}: {}", self.path.display(), e);
            }
        }
    }
}

pub trait VolumeConverter {
    fn description(&self) -> &str;

    /// Lower-case extensions this converter claims
    fn extensions(&self) -> &[&str];

    fn can_export(&self) -> bool;

    /// Content sniff over the first 512 bytes (zero padded for short
    /// files), plus the path for extension checks
    fn can_read(&self, path: &Path, first_block: &[u8]) -> bool;

    /// Materialize the source as a raw stream plus metadata
    fn convert_to_raw(&self, src: &Path, temp_dir: &Path, no_ui: bool) -> Result<RawSource>;

    /// Write a raw stream into this converter's native format
    fn convert_to_native(
        &self,
        raw: &Path,
        header_skip: u64,
        meta: &VolumeMeta,
        target: &Path,
        no_ui: bool,
        quantize8: bool,
    ) -> Result<()>;

    /// Direct source-to-UVF path. The default materializes a raw
    /// intermediate and bricks it; converters that can assemble multiple
    /// files (time series) override this.
    fn convert_to_uvf(
        &self,
        sources: &[PathBuf],
        target: &Path,
        temp_dir: &Path,
        no_ui: bool,
        params: &BrickingParams,
    ) -> Result<()> {
        let source = match sources {
            [single] => single,
            _ => {
                return Err(Error::Incompatible(format!(
                    "{} cannot assemble {} files into one volume",
                    self.description(),
                    sources.len()
                )))
            }
        };
        let raw = self.convert_to_raw(source, temp_dir, no_ui)?;
        info!(
            "{}: materialized {} for {}",
            self.description(),
            raw.path.display(),
            source.display()
        );
        let result =
            builder::raw_to_uvf(&raw.path, raw.header_skip, &raw.meta, target, temp_dir, params);
        raw.cleanup();
        result
    }

    /// Report value range and layout without a full conversion. The
    /// default pays for a raw materialization.
    fn analyze(&self, src: &Path, temp_dir: &Path, no_ui: bool) -> Result<RangeInfo> {
        let raw = self.convert_to_raw(src, temp_dir, no_ui)?;
        let result = scan_range(&raw);
        raw.cleanup();
        result
    }
}

/// Min/max scan over a raw intermediate
pub(crate) fn scan_range(raw: &RawSource) -> Result<RangeInfo> {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    builder::scan_scalars(&raw.path, raw.header_skip, &raw.meta, raw.meta.swap_endian, |v| {
        min = min.min(v);
        max = max.max(v);
    })?;

    let dt = raw.meta.data_type;
    let value_class = if dt.is_float() {
        ValueClass::Float
    } else if dt.is_signed() {
        ValueClass::Signed
    } else {
        ValueClass::Unsigned
    };

    Ok(RangeInfo {
        value_class,
        range: ValueRange::new(min, max),
        domain: raw.meta.domain,
        aspect: raw.meta.aspect,
        component_size: dt.bit_width(),
    })
}
