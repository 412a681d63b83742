//! Analyze 7.5 reader
//!
//! Fixed-offset binary header in a `.hdr` file, payload in a sibling
//! `.img`. The header's leading `sizeof_hdr` field doubles as the
//! endianness detector: it reads 348 in the header's own byte order.

use crate::converter::{RawSource, VolumeConverter};
use crate::error::{Error, Result};
use crate::types::{DataType, VolumeMeta};
use crate::util::extension;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::path::{Path, PathBuf};

pub struct AnalyzeConverter;

const HEADER_SIZE: usize = 348;

mod offsets {
    pub const SIZEOF_HDR: usize = 0;
    pub const DIM: usize = 40;
    pub const DATATYPE: usize = 70;
    pub const PIXDIM: usize = 76;
    pub const VOX_OFFSET: usize = 108;
}

fn type_from_code(code: i16) -> Option<DataType> {
    match code {
        2 => Some(DataType::U8),
        4 => Some(DataType::I16),
        8 => Some(DataType::I32),
        16 => Some(DataType::F32),
        64 => Some(DataType::F64),
        _ => None,
    }
}

struct Header {
    meta: VolumeMeta,
    vox_offset: u64,
}

fn parse_header(path: &Path, bytes: &[u8]) -> Result<Header> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::Format(format!(
            "{}: header is {} bytes, expected {}",
            path.display(),
            bytes.len(),
            HEADER_SIZE
        )));
    }

    let size_le = LittleEndian::read_i32(&bytes[offsets::SIZEOF_HDR..]);
    let size_be = BigEndian::read_i32(&bytes[offsets::SIZEOF_HDR..]);
    let big_endian = match (size_le, size_be) {
        (348, _) => false,
        (_, 348) => true,
        _ => {
            return Err(Error::Format(format!(
                "{}: not an Analyze 7.5 header",
                path.display()
            )))
        }
    };

    let read_i16 = |offset: usize| -> i16 {
        if big_endian {
            BigEndian::read_i16(&bytes[offset..])
        } else {
            LittleEndian::read_i16(&bytes[offset..])
        }
    };
    let read_f32 = |offset: usize| -> f32 {
        if big_endian {
            BigEndian::read_f32(&bytes[offset..])
        } else {
            LittleEndian::read_f32(&bytes[offset..])
        }
    };

    let ndims = read_i16(offsets::DIM);
    if !(3..=4).contains(&ndims) {
        return Err(Error::Format(format!(
            "{}: {}-dimensional data is not supported",
            path.display(),
            ndims
        )));
    }
    let domain = [
        read_i16(offsets::DIM + 2) as u64,
        read_i16(offsets::DIM + 4) as u64,
        read_i16(offsets::DIM + 6) as u64,
    ];

    let code = read_i16(offsets::DATATYPE);
    let data_type = type_from_code(code).ok_or_else(|| {
        Error::UnsupportedType(format!(
            "{}: Analyze datatype code {}",
            path.display(),
            code
        ))
    })?;

    let aspect = [
        read_f32(offsets::PIXDIM + 4),
        read_f32(offsets::PIXDIM + 8),
        read_f32(offsets::PIXDIM + 12),
    ];
    let vox_offset = read_f32(offsets::VOX_OFFSET).max(0.0) as u64;

    let mut meta = VolumeMeta::new(data_type, 1, domain);
    meta.swap_endian = big_endian != cfg!(target_endian = "big");
    meta.aspect = [
        if aspect[0] > 0.0 { aspect[0] } else { 1.0 },
        if aspect[1] > 0.0 { aspect[1] } else { 1.0 },
        if aspect[2] > 0.0 { aspect[2] } else { 1.0 },
    ];
    meta.title = "Analyze data".into();
    meta.source = crate::util::file_name(path);

    Ok(Header { meta, vox_offset })
}

fn sibling(path: &Path, ext: &str) -> PathBuf {
    path.with_extension(ext)
}

impl VolumeConverter for AnalyzeConverter {
    fn description(&self) -> &str {
        "Analyze 7.5"
    }

    fn extensions(&self) -> &[&str] {
        &["hdr", "img"]
    }

    fn can_export(&self) -> bool {
        false
    }

    fn can_read(&self, path: &Path, first_block: &[u8]) -> bool {
        let ext = extension(path);
        if ext == "hdr" {
            return first_block.len() >= 4
                && (LittleEndian::read_i32(first_block) == 348
                    || BigEndian::read_i32(first_block) == 348);
        }
        // for .img the header lives in the sibling file
        ext == "img" && sibling(path, "hdr").exists()
    }

    fn convert_to_raw(&self, src: &Path, _temp_dir: &Path, _no_ui: bool) -> Result<RawSource> {
        let (hdr_path, img_path) = if extension(src) == "img" {
            (sibling(src, "hdr"), src.to_path_buf())
        } else {
            (src.to_path_buf(), sibling(src, "img"))
        };

        let bytes = std::fs::read(&hdr_path)
            .map_err(|_| Error::Open(hdr_path.display().to_string()))?;
        let header = parse_header(&hdr_path, &bytes)?;

        if !img_path.exists() {
            return Err(Error::Open(img_path.display().to_string()));
        }

        Ok(RawSource {
            path: img_path,
            header_skip: header.vox_offset,
            delete: false,
            meta: header.meta,
        })
    }

    fn convert_to_native(
        &self,
        _raw: &Path,
        _header_skip: u64,
        _meta: &VolumeMeta,
        target: &Path,
        _no_ui: bool,
        _quantize8: bool,
    ) -> Result<()> {
        Err(Error::Write(format!(
            "{} does not support export ({})",
            self.description(),
            target.display()
        )))
    }
}
