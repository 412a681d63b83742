//! NRRD reader/writer
//!
//! Covers the subset of NRRD the pipeline needs: raw encoding, attached or
//! detached data, 3D scalar or interleaved multi-component volumes. The
//! neutral intermediate for re-bricking is written through this converter.

use super::copy_payload;
use crate::converter::{RawSource, VolumeConverter};
use crate::error::{Error, Result};
use crate::types::{DataType, VolumeMeta};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

pub struct NrrdConverter;

fn type_from_name(name: &str) -> Option<DataType> {
    match name {
        "signed char" | "int8" | "int8_t" => Some(DataType::I8),
        "uchar" | "unsigned char" | "uint8" | "uint8_t" => Some(DataType::U8),
        "short" | "short int" | "int16" | "int16_t" => Some(DataType::I16),
        "ushort" | "unsigned short" | "uint16" | "uint16_t" => Some(DataType::U16),
        "int" | "int32" | "int32_t" => Some(DataType::I32),
        "uint" | "unsigned int" | "uint32" | "uint32_t" => Some(DataType::U32),
        "longlong" | "int64" | "int64_t" => Some(DataType::I64),
        "ulonglong" | "unsigned long long" | "uint64" | "uint64_t" => Some(DataType::U64),
        "float" => Some(DataType::F32),
        "double" => Some(DataType::F64),
        _ => None,
    }
}

fn type_to_name(dt: DataType) -> &'static str {
    match dt {
        DataType::I8 => "int8",
        DataType::U8 => "uchar",
        DataType::I16 => "short",
        DataType::U16 => "ushort",
        DataType::I32 => "int",
        DataType::U32 => "uint",
        DataType::I64 => "int64",
        DataType::U64 => "uint64",
        DataType::F32 => "float",
        DataType::F64 => "double",
    }
}

struct Header {
    meta: VolumeMeta,
    /// None for attached data (payload follows the header)
    data_file: Option<String>,
    data_offset: u64,
}

fn parse_header(path: &Path) -> Result<Header> {
    let bytes = std::fs::read(path).map_err(|_| Error::Open(path.display().to_string()))?;
    if !bytes.starts_with(b"NRRD") {
        return Err(Error::Format(format!("{}: missing NRRD magic", path.display())));
    }

    // the header is line-oriented text up to the first empty line
    let mut offset = 0usize;
    let mut lines: Vec<String> = Vec::new();
    loop {
        let rest = &bytes[offset..];
        let end = match rest.iter().position(|&b| b == b'\n') {
            Some(p) => p,
            None => rest.len(),
        };
        let line = String::from_utf8_lossy(&rest[..end]).trim_end_matches('\r').to_string();
        offset += end + 1;
        if line.is_empty() {
            break;
        }
        lines.push(line);
        if offset >= bytes.len() {
            break;
        }
    }

    let mut data_type = None;
    let mut dimension = 0usize;
    let mut sizes: Vec<u64> = Vec::new();
    let mut spacings: Vec<f32> = Vec::new();
    let mut big_endian = false;
    let mut encoding = String::from("raw");
    let mut data_file = None;

    for line in lines.iter().skip(1) {
        if line.starts_with('#') {
            continue;
        }
        let (key, value) = match line.split_once(':') {
            Some((k, v)) => (k.trim().to_lowercase(), v.trim().to_string()),
            None => continue,
        };
        match key.as_str() {
            "type" => data_type = type_from_name(&value.to_lowercase()),
            "dimension" => dimension = value.parse().unwrap_or(0),
            "sizes" => {
                sizes = value
                    .split_whitespace()
                    .filter_map(|t| t.parse().ok())
                    .collect()
            }
            "spacings" => {
                spacings = value
                    .split_whitespace()
                    .filter_map(|t| t.parse().ok())
                    .collect()
            }
            "endian" => big_endian = value.eq_ignore_ascii_case("big"),
            "encoding" => encoding = value.to_lowercase(),
            "data file" | "datafile" => data_file = Some(value),
            _ => {}
        }
    }

    if encoding != "raw" {
        return Err(Error::UnsupportedType(format!(
            "{}: NRRD encoding '{}' is not supported",
            path.display(),
            encoding
        )));
    }
    let data_type = data_type
        .ok_or_else(|| Error::Format(format!("{}: unknown or missing type", path.display())))?;
    if sizes.len() != dimension || dimension < 3 || dimension > 4 {
        return Err(Error::Format(format!(
            "{}: unsupported dimension/sizes ({} / {:?})",
            path.display(),
            dimension,
            sizes
        )));
    }

    // a leading axis carries the component count for interleaved data
    let (components, domain) = if dimension == 4 {
        (sizes[0] as usize, [sizes[1], sizes[2], sizes[3]])
    } else {
        (1, [sizes[0], sizes[1], sizes[2]])
    };

    let mut meta = VolumeMeta::new(data_type, components, domain);
    meta.swap_endian = big_endian != cfg!(target_endian = "big");
    if spacings.len() >= 3 {
        let s = &spacings[spacings.len() - 3..];
        meta.aspect = [s[0], s[1], s[2]];
    }
    meta.title = "NRRD data".into();
    meta.source = crate::util::file_name(path);

    Ok(Header {
        meta,
        data_file,
        data_offset: offset as u64,
    })
}

impl VolumeConverter for NrrdConverter {
    fn description(&self) -> &str {
        "Nearly Raw Raster Data"
    }

    fn extensions(&self) -> &[&str] {
        &["nrrd", "nhdr"]
    }

    fn can_export(&self) -> bool {
        true
    }

    fn can_read(&self, _path: &Path, first_block: &[u8]) -> bool {
        first_block.starts_with(b"NRRD")
    }

    fn convert_to_raw(&self, src: &Path, _temp_dir: &Path, _no_ui: bool) -> Result<RawSource> {
        let header = parse_header(src)?;
        match header.data_file {
            Some(ref name) => {
                let data = src.parent().unwrap_or_else(|| Path::new(".")).join(name);
                if !data.exists() {
                    return Err(Error::Open(data.display().to_string()));
                }
                Ok(RawSource {
                    path: data,
                    header_skip: 0,
                    delete: false,
                    meta: header.meta,
                })
            }
            None => Ok(RawSource {
                path: src.to_path_buf(),
                header_skip: header.data_offset,
                delete: false,
                meta: header.meta,
            }),
        }
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
        let file = File::create(target)
            .map_err(|e| Error::Write(format!("{}: {}", target.display(), e)))?;
        let mut out = BufWriter::new(file);

        // the header must name the type the payload ends up with
        let written_type = if quantize8 && meta.data_type.bit_width() > 8 {
            DataType::U8
        } else {
            meta.data_type
        };

        writeln!(out, "NRRD0001")?;
        writeln!(out, "# produced by {}", self.description())?;
        writeln!(out, "type: {}", type_to_name(written_type))?;
        if meta.components > 1 {
            writeln!(out, "dimension: 4")?;
            writeln!(
                out,
                "sizes: {} {} {} {}",
                meta.components, meta.domain[0], meta.domain[1], meta.domain[2]
            )?;
            writeln!(
                out,
                "spacings: nan {} {} {}",
                meta.aspect[0], meta.aspect[1], meta.aspect[2]
            )?;
        } else {
            writeln!(out, "dimension: 3")?;
            writeln!(
                out,
                "sizes: {} {} {}",
                meta.domain[0], meta.domain[1], meta.domain[2]
            )?;
            writeln!(
                out,
                "spacings: {} {} {}",
                meta.aspect[0], meta.aspect[1], meta.aspect[2]
            )?;
        }
        writeln!(out, "encoding: raw")?;
        writeln!(
            out,
            "endian: {}",
            if cfg!(target_endian = "big") { "big" } else { "little" }
        )?;
        writeln!(out)?;

        copy_payload(raw, header_skip, meta, &mut out, quantize8)?;
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read_attached() {
        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("v.raw");
        let data: Vec<u8> = (0..27).collect();
        std::fs::write(&raw, &data).unwrap();

        let meta = VolumeMeta::new(DataType::U8, 1, [3, 3, 3]);
        let target = dir.path().join("v.nrrd");
        let conv = NrrdConverter;
        conv.convert_to_native(&raw, 0, &meta, &target, true, false)
            .unwrap();

        let block = std::fs::read(&target).unwrap();
        assert!(conv.can_read(&target, &block[..block.len().min(512)]));

        let source = conv.convert_to_raw(&target, dir.path(), true).unwrap();
        assert_eq!(source.meta.data_type, DataType::U8);
        assert_eq!(source.meta.domain, [3, 3, 3]);
        assert!(!source.delete);

        let bytes = std::fs::read(&source.path).unwrap();
        assert_eq!(&bytes[source.header_skip as usize..], &data[..]);
    }

    #[test]
    fn test_rejects_non_raw_encoding() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gz.nrrd");
        std::fs::write(
            &path,
            b"NRRD0001\ntype: uchar\ndimension: 3\nsizes: 1 1 1\nencoding: gzip\n\nx",
        )
        .unwrap();
        assert!(matches!(
            NrrdConverter.convert_to_raw(&path, dir.path(), true),
            Err(Error::UnsupportedType(_))
        ));
    }

    #[test]
    fn test_detached_header() {
        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("payload.raw");
        std::fs::write(&raw, vec![7u8; 8]).unwrap();
        let hdr = dir.path().join("v.nhdr");
        std::fs::write(
            &hdr,
            b"NRRD0001\ntype: uchar\ndimension: 3\nsizes: 2 2 2\ndata file: payload.raw\n\n",
        )
        .unwrap();

        let source = NrrdConverter.convert_to_raw(&hdr, dir.path(), true).unwrap();
        assert_eq!(source.path, raw);
        assert_eq!(source.header_skip, 0);
    }

    #[test]
    fn test_extension_claim() {
        assert_eq!(crate::util::extension(Path::new("a.NHDR")), "nhdr");
        assert!(NrrdConverter.extensions().contains(&"nhdr"));
    }
}
