//! Brick-of-values (BOV) reader/writer

use super::copy_payload;
use crate::converter::{RawSource, VolumeConverter};
use crate::error::{Error, Result};
use crate::types::{DataType, VolumeMeta};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

pub struct BovConverter;

fn type_from_format(format: &str) -> Option<DataType> {
    match format.to_uppercase().as_str() {
        "BYTE" | "CHAR" => Some(DataType::U8),
        "SHORT" => Some(DataType::I16),
        "USHORT" => Some(DataType::U16),
        "INT" => Some(DataType::I32),
        "UINT" => Some(DataType::U32),
        "FLOAT" => Some(DataType::F32),
        "DOUBLE" => Some(DataType::F64),
        _ => None,
    }
}

fn type_to_format(dt: DataType) -> Result<&'static str> {
    match dt {
        DataType::U8 => Ok("BYTE"),
        DataType::I16 => Ok("SHORT"),
        DataType::U16 => Ok("USHORT"),
        DataType::I32 => Ok("INT"),
        DataType::U32 => Ok("UINT"),
        DataType::F32 => Ok("FLOAT"),
        DataType::F64 => Ok("DOUBLE"),
        other => Err(Error::UnsupportedType(format!(
            "BOV cannot store {}",
            other
        ))),
    }
}

impl VolumeConverter for BovConverter {
    fn description(&self) -> &str {
        "Brick of Values"
    }

    fn extensions(&self) -> &[&str] {
        &["bov"]
    }

    fn can_export(&self) -> bool {
        true
    }

    fn can_read(&self, _path: &Path, first_block: &[u8]) -> bool {
        let text = String::from_utf8_lossy(first_block);
        text.contains("DATA_FILE") && text.contains("DATA_SIZE")
    }

    fn convert_to_raw(&self, src: &Path, _temp_dir: &Path, _no_ui: bool) -> Result<RawSource> {
        let text = std::fs::read_to_string(src)
            .map_err(|_| Error::Open(src.display().to_string()))?;

        let mut data_file = None;
        let mut data_size: Vec<u64> = Vec::new();
        let mut data_type = None;
        let mut big_endian = false;
        let mut brick_size: Vec<f32> = Vec::new();

        for line in text.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.split_once(':') {
                Some((k, v)) => (k.trim().to_uppercase(), v.trim()),
                None => continue,
            };
            match key.as_str() {
                "DATA_FILE" => data_file = Some(value.to_string()),
                "DATA_SIZE" => {
                    data_size = value
                        .split_whitespace()
                        .filter_map(|t| t.parse().ok())
                        .collect()
                }
                "DATA_FORMAT" => data_type = type_from_format(value),
                "DATA_ENDIAN" => big_endian = value.eq_ignore_ascii_case("big"),
                "BRICK_SIZE" => {
                    brick_size = value
                        .split_whitespace()
                        .filter_map(|t| t.parse().ok())
                        .collect()
                }
                _ => {}
            }
        }

        let data_file = data_file
            .ok_or_else(|| Error::Format(format!("{}: missing DATA_FILE", src.display())))?;
        let data_type = data_type.ok_or_else(|| {
            Error::Format(format!("{}: missing or unknown DATA_FORMAT", src.display()))
        })?;
        if data_size.len() != 3 {
            return Err(Error::Format(format!(
                "{}: DATA_SIZE must have three entries",
                src.display()
            )));
        }

        let data = src
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&data_file);
        if !data.exists() {
            return Err(Error::Open(data.display().to_string()));
        }

        let mut meta = VolumeMeta::new(data_type, 1, [data_size[0], data_size[1], data_size[2]]);
        meta.swap_endian = big_endian != cfg!(target_endian = "big");
        if brick_size.len() == 3 {
            // physical brick extent over voxel counts gives the aspect
            meta.aspect = [
                brick_size[0] / data_size[0] as f32,
                brick_size[1] / data_size[1] as f32,
                brick_size[2] / data_size[2] as f32,
            ];
        }
        meta.title = "BOV data".into();
        meta.source = crate::util::file_name(src);

        Ok(RawSource {
            path: data,
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
        if meta.components != 1 {
            return Err(Error::UnsupportedType(
                "BOV only stores scalar volumes".into(),
            ));
        }

        let data_path = target.with_extension("raw");
        let mut data_out = BufWriter::new(
            File::create(&data_path)
                .map_err(|e| Error::Write(format!("{}: {}", data_path.display(), e)))?,
        );
        let written = copy_payload(raw, header_skip, meta, &mut data_out, quantize8)?;
        data_out.flush()?;

        let format = type_to_format(written.data_type)?;
        let mut out = BufWriter::new(
            File::create(target)
                .map_err(|e| Error::Write(format!("{}: {}", target.display(), e)))?,
        );
        writeln!(out, "TIME: 0")?;
        writeln!(out, "DATA_FILE: {}", crate::util::file_name(&data_path))?;
        writeln!(
            out,
            "DATA_SIZE: {} {} {}",
            written.domain[0], written.domain[1], written.domain[2]
        )?;
        writeln!(out, "DATA_FORMAT: {}", format)?;
        writeln!(out, "VARIABLE: {}", if written.title.is_empty() { "data" } else { &written.title })?;
        writeln!(
            out,
            "DATA_ENDIAN: {}",
            if cfg!(target_endian = "big") { "BIG" } else { "LITTLE" }
        )?;
        writeln!(out, "CENTERING: zonal")?;
        writeln!(out, "BRICK_ORIGIN: 0 0 0")?;
        writeln!(
            out,
            "BRICK_SIZE: {} {} {}",
            written.aspect[0] * written.domain[0] as f32,
            written.aspect[1] * written.domain[1] as f32,
            written.aspect[2] * written.domain[2] as f32
        )?;
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("v.raw");
        let data: Vec<u8> = vec![9; 27];
        std::fs::write(&raw, &data).unwrap();

        let meta = VolumeMeta::new(DataType::U8, 1, [3, 3, 3]);
        let target = dir.path().join("out.bov");
        let conv = BovConverter;
        conv.convert_to_native(&raw, 0, &meta, &target, true, false)
            .unwrap();

        let block = std::fs::read(&target).unwrap();
        assert!(conv.can_read(&target, &block));

        let source = conv.convert_to_raw(&target, dir.path(), true).unwrap();
        assert_eq!(source.meta.domain, [3, 3, 3]);
        assert_eq!(source.meta.data_type, DataType::U8);
        assert!(!source.meta.swap_endian);
    }

    #[test]
    fn test_multi_component_rejected() {
        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("v.raw");
        std::fs::write(&raw, vec![0u8; 32]).unwrap();
        let meta = VolumeMeta::new(DataType::U8, 4, [2, 2, 2]);
        assert!(matches!(
            BovConverter.convert_to_native(&raw, 0, &meta, &dir.path().join("o.bov"), true, false),
            Err(Error::UnsupportedType(_))
        ));
    }
}
