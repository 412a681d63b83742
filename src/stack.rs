//! Directory scanning and slice-stack assembly
//!
//! A scan groups the files of a directory into stack descriptors: DICOM
//! series keyed by their series instance UID, and plain 2D images keyed by
//! their dimensions and sample layout. Descriptors only live between a scan
//! and the conversion that consumes them.

use crate::error::{Error, Result};
use crate::types::{DataType, VolumeMeta};
use crate::util::file_name;
use dicom::dictionary_std::tags;
use dicom::object::open_file;
use dicom::pixeldata::PixelDecoder;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Explicit VR big endian; every other transfer syntax stores little endian
const TS_EXPLICIT_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";
/// Encapsulated JPEG-family transfer syntaxes share this prefix
const TS_JPEG_PREFIX: &str = "1.2.840.10008.1.2.4";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackFileType {
    Dicom,
    Image,
}

impl StackFileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StackFileType::Dicom => "DICOM",
            StackFileType::Image => "IMAGE",
        }
    }
}

/// One slice of a stack. Reading the payload re-opens the source file and
/// yields a flat byte buffer.
#[derive(Debug, Clone)]
pub struct StackElement {
    pub path: PathBuf,
    /// Byte offset of the payload within the file, when the payload is an
    /// uncompressed in-file blob and the parser reported one
    pub data_offset: u64,
    /// Key the element was ordered by (slice position or instance number)
    sort_key: f64,
}

/// Ordered file list describing the slices of one logical volume
#[derive(Debug, Clone)]
pub struct StackDescriptor {
    pub file_type: StackFileType,
    pub elements: Vec<StackElement>,
    /// Slice width and height in voxels
    pub slice_dims: [u32; 2],
    pub bits_allocated: u32,
    pub bits_stored: u32,
    /// Scalars per voxel (1, 3 or 4)
    pub components: u32,
    pub big_endian: bool,
    pub jpeg_encoded: bool,
    pub aspect: [f32; 3],
    pub desc: String,
    pub modality: String,
    /// Replaces the `bits_allocated >= 32` signedness heuristic when set
    pub signed_override: Option<bool>,
}

impl StackDescriptor {
    pub fn slice_count(&self) -> usize {
        self.elements.len()
    }

    /// Signedness of the assembled voxels. DICOM sources default to the
    /// historical heuristic (allocated width >= 32 means signed) unless the
    /// caller overrides it; image sources are unsigned.
    pub fn is_signed(&self, effective_bits: u32) -> bool {
        if let Some(signed) = self.signed_override {
            return signed;
        }
        self.file_type == StackFileType::Dicom && effective_bits >= 32
    }

    /// Payload bytes of one element plus the effective allocated bit width
    /// (JPEG payloads decode to the JPEG sample width).
    pub fn read_element_payload(&self, index: usize) -> Result<(Vec<u8>, u32)> {
        let element = &self.elements[index];
        match self.file_type {
            StackFileType::Dicom => {
                let obj = open_file(&element.path)
                    .map_err(|e| Error::Read(format!("{}: {}", element.path.display(), e)))?;
                if self.jpeg_encoded {
                    let decoded = obj.decode_pixel_data().map_err(|e| {
                        Error::InvalidPayload(format!("{}: {}", element.path.display(), e))
                    })?;
                    let bits = decoded.bits_allocated() as u32;
                    Ok((decoded.data().to_vec(), bits))
                } else {
                    let pixel_data = obj
                        .element(tags::PIXEL_DATA)
                        .map_err(|e| Error::Read(format!("{}: {}", element.path.display(), e)))?;
                    let bytes = pixel_data
                        .to_bytes()
                        .map_err(|e| Error::Read(format!("{}: {}", element.path.display(), e)))?;
                    Ok((bytes.into_owned(), self.bits_allocated))
                }
            }
            StackFileType::Image => {
                let img = image::open(&element.path)
                    .map_err(|e| Error::Read(format!("{}: {}", element.path.display(), e)))?;
                let bytes = match (self.bits_allocated, self.components) {
                    (8, 1) => img.to_luma8().into_raw(),
                    (8, 3) => img.to_rgb8().into_raw(),
                    (8, 4) => img.to_rgba8().into_raw(),
                    (16, 1) => crate::types::bytes_from_scalars(&img.to_luma16().into_raw()),
                    (16, 3) => crate::types::bytes_from_scalars(&img.to_rgb16().into_raw()),
                    (bits, comps) => {
                        return Err(Error::UnsupportedType(format!(
                            "{}: {} bit, {} component image",
                            element.path.display(),
                            bits,
                            comps
                        )))
                    }
                };
                Ok((bytes, self.bits_allocated))
            }
        }
    }
}

/// Scan a directory into stack descriptors: DICOM series first, then image
/// stacks. DICOM stacks with an undecodable JPEG element are dropped whole.
pub fn scan_directory(dir: impl AsRef<Path>) -> Result<Vec<StackDescriptor>> {
    let dir = dir.as_ref();
    info!("scanning directory {}", dir.display());

    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|_| Error::Open(dir.display().to_string()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    let mut dicom_stacks: BTreeMap<String, StackDescriptor> = BTreeMap::new();
    let mut image_files: Vec<PathBuf> = Vec::new();

    for path in &paths {
        match scan_dicom_file(path) {
            Some((uid, slice)) => {
                merge_dicom_slice(&mut dicom_stacks, uid, slice);
            }
            None => image_files.push(path.clone()),
        }
    }

    let mut stacks: Vec<StackDescriptor> = Vec::new();
    for (_, mut stack) in dicom_stacks {
        stack
            .elements
            .sort_by(|a, b| a.sort_key.partial_cmp(&b.sort_key).unwrap_or(std::cmp::Ordering::Equal));
        if stack.jpeg_encoded && !probe_jpeg_stack(&stack) {
            warn!("dropping stack '{}': undecodable JPEG element", stack.desc);
            continue;
        }
        stack.desc = format!("{} Stack: {}", stack.file_type.as_str(), stack.desc);
        stacks.push(stack);
    }

    let image_count = image_files.len();
    stacks.extend(scan_image_stacks(image_files));

    info!(
        "scan complete: {} stack(s) from {} file(s), {} image candidate(s)",
        stacks.len(),
        paths.len(),
        image_count
    );
    Ok(stacks)
}

struct DicomSlice {
    element: StackElement,
    dims: [u32; 2],
    bits_allocated: u32,
    bits_stored: u32,
    components: u32,
    big_endian: bool,
    jpeg_encoded: bool,
    aspect: [f32; 3],
    desc: String,
    modality: String,
}

/// Read the stack-relevant header fields of one DICOM file. Returns None
/// for files the DICOM collaborator rejects.
fn scan_dicom_file(path: &Path) -> Option<(String, DicomSlice)> {
    let obj = open_file(path).ok()?;

    let uid = obj
        .element(tags::SERIES_INSTANCE_UID)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim().to_string())?;

    let rows = obj.element(tags::ROWS).ok()?.to_int::<u32>().ok()?;
    let columns = obj.element(tags::COLUMNS).ok()?.to_int::<u32>().ok()?;
    let bits_allocated = obj
        .element(tags::BITS_ALLOCATED)
        .ok()?
        .to_int::<u32>()
        .ok()?;
    let bits_stored = obj
        .element(tags::BITS_STORED)
        .ok()
        .and_then(|e| e.to_int::<u32>().ok())
        .unwrap_or(bits_allocated);
    let components = obj
        .element(tags::SAMPLES_PER_PIXEL)
        .ok()
        .and_then(|e| e.to_int::<u32>().ok())
        .unwrap_or(1);

    let ts = obj.meta().transfer_syntax().trim().to_string();
    let big_endian = ts == TS_EXPLICIT_BIG_ENDIAN;
    let jpeg_encoded = ts.starts_with(TS_JPEG_PREFIX);

    let spacing = obj
        .element(tags::PIXEL_SPACING)
        .ok()
        .and_then(|e| e.to_multi_float32().ok())
        .filter(|v| v.len() >= 2)
        .map(|v| [v[0], v[1]])
        .unwrap_or([1.0, 1.0]);
    let thickness = obj
        .element(tags::SLICE_THICKNESS)
        .ok()
        .and_then(|e| e.to_float32().ok())
        .unwrap_or(1.0);

    let desc = obj
        .element(tags::SERIES_DESCRIPTION)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let modality = obj
        .element(tags::MODALITY)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    // order by slice position, falling back to instance number
    let sort_key = obj
        .element(tags::IMAGE_POSITION_PATIENT)
        .ok()
        .and_then(|e| e.to_multi_float32().ok())
        .and_then(|v| v.get(2).map(|z| *z as f64))
        .or_else(|| {
            obj.element(tags::INSTANCE_NUMBER)
                .ok()
                .and_then(|e| e.to_int::<i32>().ok())
                .map(|n| n as f64)
        })
        .unwrap_or(0.0);

    Some((
        uid,
        DicomSlice {
            element: StackElement {
                path: path.to_path_buf(),
                data_offset: 0,
                sort_key,
            },
            dims: [columns, rows],
            bits_allocated,
            bits_stored,
            components,
            big_endian,
            jpeg_encoded,
            aspect: [spacing[0], spacing[1], thickness],
            desc,
            modality,
        },
    ))
}

fn merge_dicom_slice(
    stacks: &mut BTreeMap<String, StackDescriptor>,
    uid: String,
    slice: DicomSlice,
) {
    match stacks.get_mut(&uid) {
        None => {
            stacks.insert(
                uid,
                StackDescriptor {
                    file_type: StackFileType::Dicom,
                    elements: vec![slice.element],
                    slice_dims: slice.dims,
                    bits_allocated: slice.bits_allocated,
                    bits_stored: slice.bits_stored,
                    components: slice.components,
                    big_endian: slice.big_endian,
                    jpeg_encoded: slice.jpeg_encoded,
                    aspect: slice.aspect,
                    desc: slice.desc,
                    modality: slice.modality,
                    signed_override: None,
                },
            );
        }
        Some(stack) => {
            // all elements of a stack must share geometry and layout
            if stack.slice_dims != slice.dims
                || stack.bits_allocated != slice.bits_allocated
                || stack.bits_stored != slice.bits_stored
                || stack.components != slice.components
                || stack.big_endian != slice.big_endian
                || stack.jpeg_encoded != slice.jpeg_encoded
            {
                warn!(
                    "{}: layout differs from its series, skipping slice",
                    slice.element.path.display()
                );
                return;
            }
            stack.elements.push(slice.element);
        }
    }
}

/// Try to decode every JPEG element of a stack; one bad element fails the
/// probe, since a stack with missing slices has no meaningful geometry.
fn probe_jpeg_stack(stack: &StackDescriptor) -> bool {
    for (i, element) in stack.elements.iter().enumerate() {
        let ok = open_file(&element.path)
            .ok()
            .map(|obj| obj.decode_pixel_data().is_ok())
            .unwrap_or(false);
        if !ok {
            warn!(
                "can't load JPEG in stack '{}', element {}",
                stack.desc, i
            );
            return false;
        }
    }
    true
}

/// Group loose 2D images by (dims, bit depth, components)
fn scan_image_stacks(files: Vec<PathBuf>) -> Vec<StackDescriptor> {
    let mut groups: BTreeMap<(u32, u32, u32, u32), Vec<StackElement>> = BTreeMap::new();

    for path in files {
        let (w, h) = match image::image_dimensions(&path) {
            Ok(dims) => dims,
            Err(_) => continue,
        };
        let (bits, components) = match image::open(&path).map(|img| img.color()) {
            Ok(image::ColorType::L8) => (8, 1),
            Ok(image::ColorType::L16) => (16, 1),
            Ok(image::ColorType::Rgb8) => (8, 3),
            Ok(image::ColorType::Rgba8) => (8, 4),
            Ok(image::ColorType::Rgb16) => (16, 3),
            Ok(other) => {
                warn!("{}: unsupported sample layout {:?}", path.display(), other);
                continue;
            }
            Err(_) => continue,
        };
        groups.entry((w, h, bits, components)).or_default().push(StackElement {
            path,
            data_offset: 0,
            sort_key: 0.0,
        });
    }

    groups
        .into_iter()
        .map(|((w, h, bits, components), mut elements)| {
            elements.sort_by(|a, b| a.path.cmp(&b.path));
            let desc = format!(
                "IMAGE Stack: {} .. {}",
                file_name(&elements[0].path),
                file_name(&elements[elements.len() - 1].path)
            );
            StackDescriptor {
                file_type: StackFileType::Image,
                elements,
                slice_dims: [w, h],
                bits_allocated: bits,
                bits_stored: bits,
                components,
                big_endian: false,
                jpeg_encoded: false,
                aspect: [1.0, 1.0, 1.0],
                desc,
                modality: String::new(),
                signed_override: None,
            }
        })
        .collect()
}

/// Concatenate all elements of a stack into one slice-major raw file.
/// JPEG payloads are decoded, foreign byte order is swapped to host order,
/// 3-component voxels are padded to 4 with an opaque alpha. Returns the
/// metadata of the assembled stream.
pub fn assemble_to_raw(stack: &StackDescriptor, dest: &Path) -> Result<VolumeMeta> {
    info!(
        "creating intermediate file {} from {} slices",
        dest.display(),
        stack.slice_count()
    );

    let mut writer = BufWriter::new(
        File::create(dest).map_err(|e| Error::Write(format!("{}: {}", dest.display(), e)))?,
    );

    let host_big = cfg!(target_endian = "big");
    let mut effective_bits: Option<u32> = None;
    let mut out_components = stack.components as usize;

    for index in 0..stack.elements.len() {
        let (mut data, bits) = stack.read_element_payload(index)?;
        match effective_bits {
            None => effective_bits = Some(bits),
            Some(prev) if prev != bits => {
                return Err(Error::InvalidPayload(format!(
                    "{}: {} bit payload in a {} bit stack",
                    stack.elements[index].path.display(),
                    bits,
                    prev
                )))
            }
            _ => {}
        }

        if stack.big_endian != host_big {
            swap_in_place(&mut data, bits);
        }

        if stack.components == 3 && bits == 8 {
            data = pad_rgb_to_rgba(&data);
            out_components = 4;
        }

        writer.write_all(&data)?;
        info!(
            "creating intermediate file {}\n{}%",
            dest.display(),
            (100 * index) / stack.elements.len()
        );
    }
    writer.flush()?;

    let bits = effective_bits.unwrap_or(stack.bits_allocated);
    let signed = stack.is_signed(bits);
    let data_type = DataType::from_properties(bits as usize, signed, false)?;

    let mut meta = VolumeMeta::new(
        data_type,
        out_components,
        [
            stack.slice_dims[0] as u64,
            stack.slice_dims[1] as u64,
            stack.slice_count() as u64,
        ],
    );
    meta.aspect = stack.aspect;
    meta.title = format!("{} stack", stack.file_type.as_str());
    meta.source = match (stack.elements.first(), stack.elements.last()) {
        (Some(first), Some(last)) => format!(
            "{} to {}",
            file_name(&first.path),
            file_name(&last.path)
        ),
        _ => String::new(),
    };
    Ok(meta)
}

/// Swap multi-byte scalars of a payload in place
fn swap_in_place(data: &mut [u8], bits: u32) {
    match bits {
        16 => {
            for pair in data.chunks_exact_mut(2) {
                pair.swap(0, 1);
            }
        }
        32 => {
            for quad in data.chunks_exact_mut(4) {
                quad.swap(0, 3);
                quad.swap(1, 2);
            }
        }
        64 => {
            for oct in data.chunks_exact_mut(8) {
                oct.reverse();
            }
        }
        _ => {}
    }
}

/// Rewrite 3-component bytes as 4-component with opaque alpha
fn pad_rgb_to_rgba(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 3 * 4);
    for rgb in data.chunks_exact(3) {
        out.extend_from_slice(rgb);
        out.push(255);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_gray_png(dir: &Path, name: &str, w: u32, h: u32, fill: u8) {
        let img = image::GrayImage::from_pixel(w, h, image::Luma([fill]));
        img.save(dir.join(name)).unwrap();
    }

    fn write_rgb_png(dir: &Path, name: &str, w: u32, h: u32, rgb: [u8; 3]) {
        let img = image::RgbImage::from_pixel(w, h, image::Rgb(rgb));
        img.save(dir.join(name)).unwrap();
    }

    #[test]
    fn test_scan_groups_by_geometry() {
        let dir = TempDir::new().unwrap();
        write_gray_png(dir.path(), "a0.png", 4, 4, 1);
        write_gray_png(dir.path(), "a1.png", 4, 4, 2);
        write_gray_png(dir.path(), "a2.png", 4, 4, 3);
        write_gray_png(dir.path(), "b0.png", 8, 8, 1);
        write_gray_png(dir.path(), "b1.png", 8, 8, 2);

        let mut stacks = scan_directory(dir.path()).unwrap();
        stacks.sort_by_key(|s| s.slice_count());
        assert_eq!(stacks.len(), 2);
        assert_eq!(stacks[0].slice_count(), 2);
        assert_eq!(stacks[0].slice_dims, [8, 8]);
        assert_eq!(stacks[1].slice_count(), 3);
        assert_eq!(stacks[1].slice_dims, [4, 4]);
        assert_eq!(stacks[1].file_type, StackFileType::Image);
    }

    #[test]
    fn test_assemble_gray_stack() {
        let dir = TempDir::new().unwrap();
        write_gray_png(dir.path(), "s0.png", 2, 2, 10);
        write_gray_png(dir.path(), "s1.png", 2, 2, 20);

        let stacks = scan_directory(dir.path()).unwrap();
        assert_eq!(stacks.len(), 1);

        let raw = dir.path().join("stack.raw");
        let meta = assemble_to_raw(&stacks[0], &raw).unwrap();
        assert_eq!(meta.data_type, DataType::U8);
        assert_eq!(meta.domain, [2, 2, 2]);
        let bytes = std::fs::read(&raw).unwrap();
        assert_eq!(bytes, vec![10, 10, 10, 10, 20, 20, 20, 20]);
    }

    #[test]
    fn test_assemble_pads_rgb_to_rgba() {
        let dir = TempDir::new().unwrap();
        write_rgb_png(dir.path(), "rgb.png", 4, 4, [1, 2, 3]);

        let stacks = scan_directory(dir.path()).unwrap();
        assert_eq!(stacks.len(), 1);
        assert_eq!(stacks[0].components, 3);

        let raw = dir.path().join("stack.raw");
        let meta = assemble_to_raw(&stacks[0], &raw).unwrap();
        assert_eq!(meta.components, 4);
        let bytes = std::fs::read(&raw).unwrap();
        assert_eq!(bytes.len(), 4 * 4 * 4);
        for voxel in bytes.chunks_exact(4) {
            assert_eq!(voxel, [1, 2, 3, 255]);
        }
    }

    #[test]
    fn test_swap_in_place() {
        let mut data = vec![0x12, 0x34];
        swap_in_place(&mut data, 16);
        assert_eq!(data, vec![0x34, 0x12]);

        let mut data = vec![1, 2, 3, 4];
        swap_in_place(&mut data, 32);
        assert_eq!(data, vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_signedness_heuristic() {
        let stack = StackDescriptor {
            file_type: StackFileType::Dicom,
            elements: Vec::new(),
            slice_dims: [4, 4],
            bits_allocated: 32,
            bits_stored: 32,
            components: 1,
            big_endian: false,
            jpeg_encoded: false,
            aspect: [1.0; 3],
            desc: String::new(),
            modality: String::new(),
            signed_override: None,
        };
        assert!(stack.is_signed(32));
        assert!(!stack.is_signed(16));

        let overridden = StackDescriptor {
            signed_override: Some(false),
            ..stack
        };
        assert!(!overridden.is_signed(32));
    }
}
