//! QVIS dat/raw reader/writer

use super::copy_payload;
use crate::converter::{RawSource, VolumeConverter};
use crate::error::{Error, Result};
use crate::types::{DataType, VolumeMeta};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

pub struct QvisConverter;

fn type_from_format(format: &str) -> Option<DataType> {
    match format.to_uppercase().as_str() {
        "CHAR" => Some(DataType::I8),
        "UCHAR" | "BYTE" => Some(DataType::U8),
        "SHORT" => Some(DataType::I16),
        "USHORT" => Some(DataType::U16),
        "INT" => Some(DataType::I32),
        "UINT" => Some(DataType::U32),
        "LONG" => Some(DataType::I64),
        "ULONG" => Some(DataType::U64),
        "FLOAT" => Some(DataType::F32),
        "DOUBLE" => Some(DataType::F64),
        _ => None,
    }
}

fn type_to_format(dt: DataType) -> &'static str {
    match dt {
        DataType::I8 => "CHAR",
        DataType::U8 => "UCHAR",
        DataType::I16 => "SHORT",
        DataType::U16 => "USHORT",
        DataType::I32 => "INT",
        DataType::U32 => "UINT",
        DataType::I64 => "LONG",
        DataType::U64 => "ULONG",
        DataType::F32 => "FLOAT",
        DataType::F64 => "DOUBLE",
    }
}

impl VolumeConverter for QvisConverter {
    fn description(&self) -> &str {
        "QVis data"
    }

    fn extensions(&self) -> &[&str] {
        &["dat"]
    }

    fn can_export(&self) -> bool {
        true
    }

    fn can_read(&self, _path: &Path, first_block: &[u8]) -> bool {
        // the header is plain text; the object file key is mandatory
        let text = String::from_utf8_lossy(first_block);
        text.contains("ObjectFileName")
    }

    fn convert_to_raw(&self, src: &Path, _temp_dir: &Path, _no_ui: bool) -> Result<RawSource> {
        let text = std::fs::read_to_string(src)
            .map_err(|_| Error::Open(src.display().to_string()))?;

        let mut object_file = None;
        let mut resolution: Vec<u64> = Vec::new();
        let mut thickness: Vec<f32> = Vec::new();
        let mut format = None;
        let mut components = 1usize;

        for line in text.lines() {
            let (key, value) = match line.split_once(':') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => continue,
            };
            match key {
                "ObjectFileName" => object_file = Some(value.to_string()),
                "Resolution" => {
                    resolution = value
                        .split_whitespace()
                        .filter_map(|t| t.parse().ok())
                        .collect()
                }
                "SliceThickness" => {
                    thickness = value
                        .split_whitespace()
                        .filter_map(|t| t.parse().ok())
                        .collect()
                }
                "Format" => format = type_from_format(value),
                "ObjectModel" => {
                    components = match value.to_uppercase().as_str() {
                        "RGBA" => 4,
                        "RGB" => 3,
                        _ => 1,
                    }
                }
                _ => {}
            }
        }

        let object_file = object_file
            .ok_or_else(|| Error::Format(format!("{}: missing ObjectFileName", src.display())))?;
        let data_type = format
            .ok_or_else(|| Error::Format(format!("{}: missing or unknown Format", src.display())))?;
        if resolution.len() != 3 {
            return Err(Error::Format(format!(
                "{}: Resolution must have three entries",
                src.display()
            )));
        }

        let data = src
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&object_file);
        if !data.exists() {
            return Err(Error::Open(data.display().to_string()));
        }

        let mut meta = VolumeMeta::new(data_type, components, [
            resolution[0],
            resolution[1],
            resolution[2],
        ]);
        if thickness.len() == 3 {
            meta.aspect = [thickness[0], thickness[1], thickness[2]];
        }
        meta.title = "QVis data".into();
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
        let data_path = target.with_extension("raw");
        let mut data_out = BufWriter::new(
            File::create(&data_path)
                .map_err(|e| Error::Write(format!("{}: {}", data_path.display(), e)))?,
        );
        let written = copy_payload(raw, header_skip, meta, &mut data_out, quantize8)?;
        data_out.flush()?;

        let mut out = BufWriter::new(
            File::create(target)
                .map_err(|e| Error::Write(format!("{}: {}", target.display(), e)))?,
        );
        let data_name = crate::util::file_name(&data_path);
        writeln!(out, "ObjectFileName: {}", data_name)?;
        writeln!(out, "TaggedFileName: ---")?;
        writeln!(
            out,
            "Resolution: {} {} {}",
            written.domain[0], written.domain[1], written.domain[2]
        )?;
        writeln!(
            out,
            "SliceThickness: {} {} {}",
            written.aspect[0], written.aspect[1], written.aspect[2]
        )?;
        writeln!(out, "Format: {}", type_to_format(written.data_type))?;
        writeln!(
            out,
            "ObjectModel: {}",
            match written.components {
                4 => "RGBA",
                3 => "RGB",
                _ => "I",
            }
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
        let data: Vec<u8> = (0..8).collect();
        std::fs::write(&raw, &data).unwrap();

        let meta = VolumeMeta::new(DataType::U8, 1, [2, 2, 2]);
        let target = dir.path().join("out.dat");
        let conv = QvisConverter;
        conv.convert_to_native(&raw, 0, &meta, &target, true, false)
            .unwrap();

        let block = std::fs::read(&target).unwrap();
        assert!(conv.can_read(&target, &block));

        let source = conv.convert_to_raw(&target, dir.path(), true).unwrap();
        assert_eq!(source.meta.domain, [2, 2, 2]);
        assert_eq!(std::fs::read(&source.path).unwrap(), data);
    }

    #[test]
    fn test_missing_object_file() {
        let dir = TempDir::new().unwrap();
        let dat = dir.path().join("broken.dat");
        std::fs::write(&dat, "Resolution: 2 2 2\nFormat: UCHAR\n").unwrap();
        assert!(matches!(
            QvisConverter.convert_to_raw(&dat, dir.path(), true),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_format_names() {
        assert_eq!(type_from_format("uchar"), Some(DataType::U8));
        assert_eq!(type_from_format("FLOAT"), Some(DataType::F32));
        assert_eq!(type_from_format("nonsense"), None);
        assert_eq!(type_to_format(DataType::U16), "USHORT");
    }
}
