//! The I/O manager facade
//!
//! Owns the converter registries and brick-size settings and orchestrates
//! scanning, conversion, merging, re-bricking, isosurface extraction and
//! expression evaluation. All intermediates live in a caller-supplied temp
//! directory and are removed on success and failure alike.

use crate::builder::{self, BrickingParams, TempGuard};
use crate::converter::{RangeInfo, RawSource, ValueClass, VolumeConverter};
use crate::error::{Error, Result};
use crate::evaluator;
use crate::formats::{AnalyzeConverter, BovConverter, NrrdConverter, QvisConverter};
use crate::geometry::{Mesh, MeshConverter, ObjConverter, PlyConverter};
use crate::iso;
use crate::merge::{self, MergeInput};
use crate::stack::{self, StackDescriptor};
use crate::types::ValueRange;
use crate::util::{extension, file_name};
use crate::uvf::{BlockSemantic, UvfBuilder, UvfDataset, UvfMetadata, UVF_MAGIC};
use rand::Rng;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{error, info, warn};

pub const DEFAULT_MAX_BRICK_SIZE: u64 = 256;
pub const DEFAULT_BRICK_OVERLAP: u64 = 2;

/// A dataset format the renderer can open directly, no conversion needed
pub trait FileBackedDataset {
    fn name(&self) -> &str;
    fn extensions(&self) -> &[&str];
    fn can_open(&self, path: &Path, first_block: &[u8]) -> bool;
    /// Checksum verification, for readers that carry one
    fn verify(&self, path: &Path) -> Result<bool>;
}

/// The built-in UVF reader
struct UvfReader;

impl FileBackedDataset for UvfReader {
    fn name(&self) -> &str {
        "Universal Volume Format"
    }

    fn extensions(&self) -> &[&str] {
        &["uvf"]
    }

    fn can_open(&self, _path: &Path, first_block: &[u8]) -> bool {
        first_block.starts_with(UVF_MAGIC)
    }

    fn verify(&self, path: &Path) -> Result<bool> {
        UvfDataset::open(path)?.verify()
    }
}

pub struct IoManager {
    converters: Vec<Box<dyn VolumeConverter>>,
    final_converter: Option<Box<dyn VolumeConverter>>,
    mesh_converters: Vec<Box<dyn MeshConverter>>,
    readers: Vec<Arc<dyn FileBackedDataset>>,
    max_brick_size: u64,
    brick_overlap: u64,
}

impl Default for IoManager {
    fn default() -> Self {
        Self::new()
    }
}

impl IoManager {
    pub fn new() -> Self {
        Self {
            converters: vec![
                Box::new(QvisConverter),
                Box::new(NrrdConverter),
                Box::new(BovConverter),
                Box::new(AnalyzeConverter),
            ],
            final_converter: None,
            mesh_converters: vec![Box::new(PlyConverter), Box::new(ObjConverter)],
            readers: vec![Arc::new(UvfReader)],
            max_brick_size: DEFAULT_MAX_BRICK_SIZE,
            brick_overlap: DEFAULT_BRICK_OVERLAP,
        }
    }

    // ---- registration ---------------------------------------------------

    pub fn register_converter(&mut self, converter: Box<dyn VolumeConverter>) {
        self.converters.push(converter);
    }

    /// The final converter is the fallback tried when no sniffer accepts a
    /// file; registering a new one replaces the old
    pub fn register_final_converter(&mut self, converter: Box<dyn VolumeConverter>) {
        self.final_converter = Some(converter);
    }

    pub fn register_mesh_converter(&mut self, converter: Box<dyn MeshConverter>) {
        self.mesh_converters.push(converter);
    }

    pub fn add_reader(&mut self, reader: Arc<dyn FileBackedDataset>) {
        self.readers.push(reader);
    }

    pub fn max_brick_size(&self) -> u64 {
        self.max_brick_size
    }

    pub fn brick_overlap(&self) -> u64 {
        self.brick_overlap
    }

    pub fn set_max_brick_size(&mut self, max_brick_size: u64) -> bool {
        if max_brick_size > self.brick_overlap * 2 {
            self.max_brick_size = max_brick_size;
            true
        } else {
            false
        }
    }

    pub fn set_brick_overlap(&mut self, brick_overlap: u64) -> bool {
        if self.max_brick_size > brick_overlap * 2 {
            self.brick_overlap = brick_overlap;
            true
        } else {
            false
        }
    }

    fn params(&self, max_brick_size: u64, overlap: u64, quantize8: bool) -> BrickingParams {
        BrickingParams {
            max_brick_size,
            overlap,
            quantize8,
            ..Default::default()
        }
    }

    // ---- identification -------------------------------------------------

    /// All converters whose sniffer accepts the file, in registration
    /// order. Reads the first 512 bytes exactly once; I/O errors propagate.
    pub fn identify(&self, path: &Path) -> Result<Vec<&dyn VolumeConverter>> {
        let block = read_first_block(path)?;
        let mut accepted = Vec::new();
        for converter in &self.converters {
            info!("attempting converter '{}'", converter.description());
            if converter.can_read(path, &block) {
                info!(
                    "converter '{}' can read '{}'",
                    converter.description(),
                    path.display()
                );
                accepted.push(converter.as_ref());
            }
        }
        Ok(accepted)
    }

    /// Case-insensitive extension lookup over the registry
    pub fn converter_for_extension(
        &self,
        ext: &str,
        must_export: bool,
    ) -> Option<&dyn VolumeConverter> {
        let ext = ext.to_lowercase();
        self.converters
            .iter()
            .find(|c| {
                (!must_export || c.can_export()) && c.extensions().contains(&ext.as_str())
            })
            .map(|c| c.as_ref())
    }

    pub fn mesh_converter_for_extension(
        &self,
        ext: &str,
        must_export: bool,
    ) -> Option<&dyn MeshConverter> {
        let ext = ext.to_lowercase();
        self.mesh_converters
            .iter()
            .find(|c| {
                (!must_export || c.can_export()) && c.extensions().contains(&ext.as_str())
            })
            .map(|c| c.as_ref())
    }

    // ---- stacks ---------------------------------------------------------

    pub fn scan_directory(&self, dir: impl AsRef<Path>) -> Result<Vec<StackDescriptor>> {
        stack::scan_directory(dir)
    }

    /// Assemble a stack into a raw intermediate and brick it into `target`
    pub fn convert_stack(
        &self,
        stack: &StackDescriptor,
        target: &Path,
        temp_dir: &Path,
        max_brick_size: u64,
        brick_overlap: u64,
        quantize8: bool,
    ) -> Result<()> {
        info!(
            "request to convert stack of {} files to {}",
            stack.slice_count(),
            target.display()
        );

        let temp = temp_dir.join(format!("{}~", file_name(target)));
        let mut guard = TempGuard::new();
        guard.add(temp.clone());

        let meta = stack::assemble_to_raw(stack, &temp)?;
        builder::raw_to_uvf(
            &temp,
            0,
            &meta,
            target,
            temp_dir,
            &self.params(max_brick_size, brick_overlap, quantize8),
        )
    }

    // ---- file conversion ------------------------------------------------

    /// Convert one source file
    #[allow(clippy::too_many_arguments)]
    pub fn convert_file(
        &self,
        source: &Path,
        target: &Path,
        temp_dir: &Path,
        no_ui: bool,
        max_brick_size: u64,
        brick_overlap: u64,
        quantize8: bool,
    ) -> Result<()> {
        self.convert_files(
            std::slice::from_ref(&source.to_path_buf()),
            target,
            temp_dir,
            no_ui,
            max_brick_size,
            brick_overlap,
            quantize8,
        )
    }

    /// Convert one or more source files. Multiple sources are only legal
    /// for UVF targets, and only when a converter can assemble them.
    #[allow(clippy::too_many_arguments)]
    pub fn convert_files(
        &self,
        sources: &[PathBuf],
        target: &Path,
        temp_dir: &Path,
        no_ui: bool,
        max_brick_size: u64,
        brick_overlap: u64,
        quantize8: bool,
    ) -> Result<()> {
        let first = sources
            .first()
            .ok_or_else(|| Error::Read("no files to convert".into()))?;
        info!(
            "request to convert {} dataset(s) to {}",
            sources.len(),
            target.display()
        );

        let params = self.params(max_brick_size, brick_overlap, quantize8);

        if extension(target) == "uvf" {
            let mut last_err: Option<Error> = None;
            for converter in self.identify(first)? {
                match converter.convert_to_uvf(sources, target, temp_dir, no_ui, &params) {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        warn!(
                            "converter {} can read the data, but conversion failed: {}",
                            converter.description(),
                            e
                        );
                        last_err = Some(e);
                    }
                }
            }

            if let Some(fallback) = &self.final_converter {
                info!("attempting fallback converter");
                return fallback.convert_to_uvf(sources, target, temp_dir, no_ui, &params);
            }
            return Err(last_err
                .unwrap_or_else(|| Error::NoConverter(first.display().to_string())));
        }

        if sources.len() > 1 {
            error!("cannot convert multiple files to anything but UVF");
            return Err(Error::MultiInputToNative);
        }

        // non-UVF target: materialize a raw stream, then write the native
        // format whose extension matches
        let raw = self.source_to_raw(first, temp_dir, no_ui)?;
        let result = self.raw_to_native(&raw, target, no_ui, quantize8);
        raw.cleanup();
        result
    }

    /// Materialize any supported source as a raw intermediate
    fn source_to_raw(&self, source: &Path, temp_dir: &Path, no_ui: bool) -> Result<RawSource> {
        if extension(source) == "uvf" {
            let mut ds = UvfDataset::open(source)?;
            let raw_path = temp_dir.join(format!("{}.raw", file_name(source)));
            if let Err(e) = ds.export_lod(0, &raw_path) {
                if raw_path.exists() {
                    let _ = std::fs::remove_file(&raw_path);
                }
                return Err(e);
            }
            let meta = ds.metadata().volume.clone();
            return Ok(RawSource {
                path: raw_path,
                header_skip: 0,
                delete: true,
                meta,
            });
        }

        let mut last_err: Option<Error> = None;
        for converter in self.identify(source)? {
            match converter.convert_to_raw(source, temp_dir, no_ui) {
                Ok(raw) => {
                    info!("conversion using '{}' succeeded", converter.description());
                    return Ok(raw);
                }
                Err(e) => last_err = Some(e),
            }
        }

        if let Some(fallback) = &self.final_converter {
            info!("no converter can read the data, trying fallback converter");
            return fallback.convert_to_raw(source, temp_dir, no_ui);
        }

        Err(last_err.unwrap_or_else(|| Error::NoConverter(source.display().to_string())))
    }

    fn raw_to_native(
        &self,
        raw: &RawSource,
        target: &Path,
        no_ui: bool,
        quantize8: bool,
    ) -> Result<()> {
        let target_ext = extension(target);
        let mut attempted = false;
        for converter in &self.converters {
            if !converter.extensions().contains(&target_ext.as_str()) {
                continue;
            }
            attempted = true;
            match converter.convert_to_native(
                &raw.path,
                raw.header_skip,
                &raw.meta,
                target,
                no_ui,
                quantize8,
            ) {
                Ok(()) => return Ok(()),
                Err(e) => warn!(
                    "{} claims extension '{}' but failed: {}",
                    converter.description(),
                    target_ext,
                    e
                ),
            }
        }
        if attempted {
            Err(Error::Write(format!(
                "no converter could write {}",
                target.display()
            )))
        } else {
            Err(Error::NoConverter(format!("unknown extension '{}'", target_ext)))
        }
    }

    // ---- merging --------------------------------------------------------

    /// Merge co-dimensional sources into one volume, additively or by
    /// maximum, each input mapped through its scale and bias first.
    #[allow(clippy::too_many_arguments)]
    pub fn merge(
        &self,
        sources: &[PathBuf],
        scales: &[f64],
        biases: &[f64],
        target: &Path,
        temp_dir: &Path,
        use_max: bool,
        no_ui: bool,
    ) -> Result<()> {
        if sources.is_empty() || sources.len() != scales.len() || sources.len() != biases.len() {
            return Err(Error::Incompatible(
                "sources, scales and biases must have equal length".into(),
            ));
        }
        info!("request to merge {} data sets into {}", sources.len(), target.display());

        let mut guard = TempGuard::new();
        let mut inputs: Vec<MergeInput> = Vec::with_capacity(sources.len());
        let mut metas = Vec::with_capacity(sources.len());

        for (i, source) in sources.iter().enumerate() {
            info!("reading data set {}", source.display());
            let raw = if extension(source) == "uvf" {
                let mut ds = UvfDataset::open(source)?;
                let suffix: u32 = rand::thread_rng().gen();
                let raw_path = temp_dir.join(format!("{}{}.raw", file_name(source), suffix));
                guard.add(raw_path.clone());
                ds.export_lod(0, &raw_path)?;
                RawSource {
                    path: raw_path,
                    header_skip: 0,
                    delete: true,
                    meta: ds.metadata().volume.clone(),
                }
            } else {
                let raw = self.source_to_raw(source, temp_dir, no_ui)?;
                if raw.delete {
                    guard.add(raw.path.clone());
                }
                raw
            };

            inputs.push(MergeInput {
                path: raw.path.clone(),
                header_skip: raw.header_skip,
                scale: scales[i],
                bias: biases[i],
                delete: raw.delete,
            });
            metas.push(raw.meta);
        }

        merge::check_mergeable(&metas)?;
        for meta in &metas[1..] {
            if meta.aspect != metas[0].aspect {
                warn!("different aspect ratios found");
            }
        }

        let merged = temp_dir.join("merged.raw");
        guard.add(merged.clone());
        let window = (self.max_brick_size * self.max_brick_size * self.max_brick_size) as usize;
        let mut meta = metas[0].clone();
        meta.title = "Merged data from multiple files".into();
        meta.source = sources
            .iter()
            .map(|p| file_name(p))
            .collect::<Vec<_>>()
            .join(" ");
        merge::merge_raw_streams(&inputs, &meta, &merged, use_max, window)?;

        if extension(target) == "uvf" {
            builder::raw_to_uvf(
                &merged,
                0,
                &meta,
                target,
                temp_dir,
                &self.params(self.max_brick_size, self.brick_overlap, false),
            )
        } else {
            let raw = RawSource {
                path: merged.clone(),
                header_skip: 0,
                delete: false,
                meta,
            };
            self.raw_to_native(&raw, target, no_ui, false)
        }
    }

    // ---- re-bricking ----------------------------------------------------

    /// Rewrite an existing UVF with new brick parameters, going through a
    /// neutral intermediate format
    pub fn rebrick(
        &self,
        source: &Path,
        target: &Path,
        temp_dir: &Path,
        max_brick_size: u64,
        brick_overlap: u64,
        quantize8: bool,
    ) -> Result<()> {
        info!("rebricking (phase 1/2)");
        let mut guard = TempGuard::new();
        let tmp = temp_dir.join(format!("{}.nrrd", file_name(source)));
        guard.add(tmp.clone());

        self.convert_file(
            source,
            &tmp,
            temp_dir,
            true,
            self.max_brick_size,
            self.brick_overlap,
            false,
        )
        .map_err(|e| {
            error!("unable to extract raw data from {}", source.display());
            e
        })?;

        info!("rebricking (phase 2/2)");
        self.convert_file(
            &tmp,
            target,
            temp_dir,
            true,
            max_brick_size,
            brick_overlap,
            quantize8,
        )
        .map_err(|e| {
            error!(
                "unable to convert {} into new UVF {}",
                tmp.display(),
                target.display()
            );
            e
        })
    }

    // ---- export ---------------------------------------------------------

    /// Export one LOD of a UVF into a native format chosen by extension
    pub fn export_dataset(
        &self,
        source: &Path,
        lod: usize,
        target: &Path,
        temp_dir: &Path,
    ) -> Result<()> {
        let target_ext = extension(target);
        if self.converter_for_extension(&target_ext, false).is_none() {
            return Err(Error::NoConverter(format!(
                "unknown extension '{}'",
                target_ext
            )));
        }

        let mut guard = TempGuard::new();
        let tmp = temp_dir.join(format!("{}.tmp_raw", file_name(target)));
        guard.add(tmp.clone());

        let mut ds = UvfDataset::open(source)?;
        ds.export_lod(lod, &tmp)?;
        info!("writing target dataset");

        let mut meta = ds.metadata().volume.clone();
        meta.domain = ds.domain(lod);
        let raw = RawSource {
            path: tmp,
            header_skip: 0,
            delete: false,
            meta,
        };
        self.raw_to_native(&raw, target, true, false)
    }

    // ---- isosurfaces ----------------------------------------------------

    /// Extract an isosurface from one LOD into a mesh file chosen by the
    /// target extension. Scalar volumes only.
    pub fn extract_isosurface(
        &self,
        source: &Path,
        lod: usize,
        isovalue: f64,
        color: [f32; 4],
        target: &Path,
        _temp_dir: &Path,
    ) -> Result<()> {
        let ext = extension(target);
        let converter = self
            .mesh_converter_for_extension(&ext, true)
            .ok_or_else(|| Error::NoMeshConverter(ext.clone()))?;

        let mut ds = UvfDataset::open(source)?;
        let mesh = match iso::extract_isosurface(&mut ds, lod, isovalue, color) {
            Ok(mesh) => mesh,
            Err(e) => {
                if target.exists() {
                    let _ = std::fs::remove_file(target);
                }
                return Err(e);
            }
        };
        converter.convert_to_native(&mesh, target)
    }

    // ---- meshes ---------------------------------------------------------

    /// Load a mesh through the first converter that accepts the file
    pub fn load_mesh(&self, path: &Path) -> Result<Mesh> {
        info!("opening mesh file {}", path.display());
        for converter in &self.mesh_converters {
            info!("attempting converter '{}'", converter.description());
            if converter.can_read(path) {
                return converter.convert_to_mesh(path);
            }
        }
        Err(Error::NoMeshConverter(extension(path)))
    }

    pub fn export_mesh(&self, mesh: &Mesh, target: &Path) -> Result<()> {
        let ext = extension(target);
        let converter = self
            .mesh_converter_for_extension(&ext, true)
            .ok_or_else(|| Error::NoMeshConverter(ext.clone()))?;
        converter.convert_to_native(mesh, target)
    }

    /// Copy a UVF and append a mesh as a geometry block
    pub fn add_mesh(&self, source: &Path, mesh_file: &Path, target: &Path) -> Result<()> {
        let mut mesh = self.load_mesh(mesh_file)?;
        if mesh.normals.len() != mesh.vertices.len() {
            mesh.recompute_normals();
        }

        let mut ds = UvfDataset::open(source)?;
        let metadata = UvfMetadata::new(ds.metadata().volume.clone(), ds.layout().clone())
            .with_codec(ds.metadata().codec)
            .with_value_range(ds.value_range());
        let mut out = UvfBuilder::create(target, metadata)?;
        for key in ds.brick_keys() {
            let data = ds.read_brick(key)?;
            out.append_brick(key, &data)?;
        }
        if let Some(block) = ds.maxmin_block()? {
            out.append_block(BlockSemantic::MaxMin, &block)?;
        }
        if let Some(block) = ds.histogram_1d()? {
            out.append_block(BlockSemantic::Histogram1D, &block)?;
        }
        if let Some(block) = ds.histogram_2d()? {
            out.append_block(BlockSemantic::Histogram2D, &block)?;
        }
        info!("adding triangle soup block ({} triangles)", mesh.triangle_count());
        out.append_block(BlockSemantic::Geometry, &mesh.to_block())?;
        out.finalize()
    }

    // ---- expressions ----------------------------------------------------

    /// Evaluate a voxel expression over mergeable volumes into a new UVF
    pub fn evaluate_expression(
        &self,
        expression: &str,
        volumes: &[PathBuf],
        output: &Path,
    ) -> Result<()> {
        evaluator::evaluate_expression(expression, volumes, output)
    }

    // ---- analysis -------------------------------------------------------

    /// Report range and layout of a dataset without converting it
    pub fn analyze_dataset(&self, source: &Path, temp_dir: &Path) -> Result<RangeInfo> {
        if extension(source) == "uvf" {
            let mut ds = UvfDataset::open(source)?;
            if ds.components() != 1 {
                return Err(Error::Incompatible(
                    "only scalar data can be analyzed".into(),
                ));
            }
            let range = ds.compute_range()?;
            let dt = ds.data_type();
            let value_class = if dt.is_float() {
                ValueClass::Float
            } else if dt.is_signed() {
                ValueClass::Signed
            } else {
                ValueClass::Unsigned
            };
            return Ok(RangeInfo {
                value_class,
                range: ValueRange::new(range.min, range.max),
                domain: ds.domain(0),
                aspect: ds.metadata().volume.aspect,
                component_size: dt.bit_width(),
            });
        }

        let ext = extension(source);
        if let Some(converter) = self.converter_for_extension(&ext, false) {
            if let Ok(info) = converter.analyze(source, temp_dir, true) {
                return Ok(info);
            }
        }
        match &self.final_converter {
            Some(fallback) => fallback.analyze(source, temp_dir, true),
            None => Err(Error::NoConverter(source.display().to_string())),
        }
    }

    // ---- dataset readers ------------------------------------------------

    /// Lookup handle for the reader of a file; the handle may already be
    /// dropped by the time it is used
    pub fn reader(&self, path: &Path) -> Option<Weak<dyn FileBackedDataset>> {
        let block = read_first_block(path).ok()?;
        self.readers
            .iter()
            .find(|r| r.can_open(path, &block))
            .map(Arc::downgrade)
    }

    /// A file needs conversion when no registered reader opens it directly
    pub fn needs_conversion(&self, path: &Path) -> bool {
        self.reader(path)
            .and_then(|weak| weak.upgrade())
            .is_none()
    }

    /// Checksum verification through the file's reader. Unknown formats
    /// are an error, not a panic.
    pub fn verify(&self, path: &Path) -> Result<bool> {
        match self.reader(path).and_then(|weak| weak.upgrade()) {
            Some(reader) => reader.verify(path),
            None => Err(Error::NoConverter(path.display().to_string())),
        }
    }

    // ---- dialog strings and format lists --------------------------------

    /// `"All known Files (...);;Name (*.ext);;...;;All Files (*)"`
    pub fn load_dialog_string(&self) -> String {
        let mut dialog = String::from("All known Files (");
        let mut seen: Vec<String> = Vec::new();

        for reader in &self.readers {
            for ext in reader.extensions() {
                if !seen.contains(&ext.to_string()) {
                    dialog.push_str(&format!("*.{} ", ext));
                    seen.push(ext.to_string());
                }
            }
        }
        for converter in &self.converters {
            for ext in converter.extensions() {
                if !seen.contains(&ext.to_string()) {
                    dialog.push_str(&format!("*.{} ", ext));
                    seen.push(ext.to_string());
                }
            }
        }
        dialog.push_str(");;");

        for reader in &self.readers {
            dialog.push_str(&format!("{} (", reader.name()));
            let exts: Vec<String> = reader.extensions().iter().map(|e| format!("*.{}", e)).collect();
            dialog.push_str(&exts.join(" "));
            dialog.push_str(");;");
        }
        for converter in &self.converters {
            dialog.push_str(&format!("{} (", converter.description()));
            let exts: Vec<String> =
                converter.extensions().iter().map(|e| format!("*.{}", e)).collect();
            dialog.push_str(&exts.join(" "));
            dialog.push_str(");;");
        }

        dialog.push_str("All Files (*)");
        dialog
    }

    pub fn export_dialog_string(&self) -> String {
        let mut dialog = String::new();
        for converter in &self.converters {
            if !converter.can_export() {
                continue;
            }
            for ext in converter.extensions() {
                dialog.push_str(&format!("{} (*.{});;", converter.description(), ext));
            }
        }
        dialog
    }

    pub fn mesh_dialog_string(&self) -> String {
        let mut dialog = String::from("All known Geometry Files (");
        let mut exts: Vec<String> = Vec::new();
        for converter in &self.mesh_converters {
            for ext in converter.extensions() {
                exts.push(format!("*.{}", ext));
            }
        }
        dialog.push_str(&exts.join(" "));
        dialog.push_str(");;");
        for converter in &self.mesh_converters {
            let exts: Vec<String> =
                converter.extensions().iter().map(|e| format!("*.{}", e)).collect();
            dialog.push_str(&format!("{} ({});;", converter.description(), exts.join(" ")));
        }
        dialog.push_str("All Files (*)");
        dialog
    }

    /// (extension, description) of every importable format
    pub fn import_format_list(&self) -> Vec<(String, String)> {
        let mut list = vec![("uvf".to_string(), "Universal Volume Format".to_string())];
        for converter in &self.converters {
            for ext in converter.extensions() {
                list.push((ext.to_string(), converter.description().to_string()));
            }
        }
        list
    }

    /// (extension, description) of every exportable format
    pub fn export_format_list(&self) -> Vec<(String, String)> {
        let mut list = vec![("uvf".to_string(), "Universal Volume Format".to_string())];
        for converter in &self.converters {
            if converter.can_export() {
                for ext in converter.extensions() {
                    list.push((ext.to_string(), converter.description().to_string()));
                }
            }
        }
        list
    }

    /// (extension, description, exportable) of every known format
    pub fn format_list(&self) -> Vec<(String, String, bool)> {
        let mut list = vec![(
            "uvf".to_string(),
            "Universal Volume Format".to_string(),
            true,
        )];
        for converter in &self.converters {
            for ext in converter.extensions() {
                list.push((
                    ext.to_string(),
                    converter.description().to_string(),
                    converter.can_export(),
                ));
            }
        }
        list
    }

    pub fn mesh_format_list(&self) -> Vec<(String, String, bool)> {
        let mut list = Vec::new();
        for converter in &self.mesh_converters {
            for ext in converter.extensions() {
                list.push((
                    ext.to_string(),
                    converter.description().to_string(),
                    converter.can_export(),
                ));
            }
        }
        list
    }
}

/// First 512 bytes of a file, zero padded when the file is shorter
fn read_first_block(path: &Path) -> Result<[u8; 512]> {
    let mut block = [0u8; 512];
    let mut file = File::open(path).map_err(|_| Error::Open(path.display().to_string()))?;
    let mut filled = 0usize;
    while filled < block.len() {
        match file.read(&mut block[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::RawConverter;
    use crate::types::{DataType, VolumeMeta};
    use tempfile::TempDir;

    fn write_nrrd(dir: &Path, name: &str, data: &[u8], dims: [u64; 3]) -> PathBuf {
        let raw = dir.join("src.raw");
        std::fs::write(&raw, data).unwrap();
        let target = dir.join(name);
        let meta = VolumeMeta::new(DataType::U8, 1, dims);
        NrrdConverter
            .convert_to_native(&raw, 0, &meta, &target, true, false)
            .unwrap();
        std::fs::remove_file(&raw).unwrap();
        target
    }

    #[test]
    fn test_identify_stability() {
        let dir = TempDir::new().unwrap();
        let nrrd = write_nrrd(dir.path(), "v.nrrd", &[0u8; 8], [2, 2, 2]);

        let manager = IoManager::new();
        let accepted = manager.identify(&nrrd).unwrap();
        assert!(accepted
            .iter()
            .any(|c| c.description() == NrrdConverter.description()));
    }

    #[test]
    fn test_identify_missing_file_propagates() {
        let manager = IoManager::new();
        assert!(manager.identify(Path::new("/nonexistent/file")).is_err());
    }

    #[test]
    fn test_converter_for_extension() {
        let manager = IoManager::new();
        assert!(manager.converter_for_extension("NRRD", true).is_some());
        assert!(manager.converter_for_extension("nrrd", true).is_some());
        // Analyze cannot export
        assert!(manager.converter_for_extension("hdr", false).is_some());
        assert!(manager.converter_for_extension("hdr", true).is_none());
        assert!(manager.converter_for_extension("xyz", false).is_none());
    }

    #[test]
    fn test_convert_nrrd_to_uvf_and_back() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..64).collect();
        let nrrd = write_nrrd(dir.path(), "v.nrrd", &data, [4, 4, 4]);

        let manager = IoManager::new();
        let uvf = dir.path().join("v.uvf");
        manager
            .convert_file(&nrrd, &uvf, dir.path(), true, 16, 2, false)
            .unwrap();
        assert!(uvf.exists());
        assert!(!manager.needs_conversion(&uvf));
        assert!(manager.verify(&uvf).unwrap());

        // back out to nrrd and compare payloads
        let back = dir.path().join("back.nrrd");
        manager
            .convert_file(&uvf, &back, dir.path(), true, 16, 2, false)
            .unwrap();
        let source = NrrdConverter.convert_to_raw(&back, dir.path(), true).unwrap();
        let bytes = std::fs::read(&source.path).unwrap();
        assert_eq!(&bytes[source.header_skip as usize..], &data[..]);

        // no temp leftovers
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains('~') || n.contains(".tmp_raw") || n.ends_with(".uvf.raw"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left: {:?}", leftovers);
    }

    #[test]
    fn test_multi_input_to_native_rejected() {
        let dir = TempDir::new().unwrap();
        let a = write_nrrd(dir.path(), "a.nrrd", &[0u8; 8], [2, 2, 2]);
        let b = write_nrrd(dir.path(), "b.nrrd", &[0u8; 8], [2, 2, 2]);

        let manager = IoManager::new();
        let result = manager.convert_files(
            &[a, b],
            &dir.path().join("out.bov"),
            dir.path(),
            true,
            16,
            2,
            false,
        );
        assert!(matches!(result, Err(Error::MultiInputToNative)));
    }

    #[test]
    fn test_no_converter_without_fallback() {
        let dir = TempDir::new().unwrap();
        let junk = dir.path().join("junk.zzz");
        std::fs::write(&junk, b"garbage").unwrap();

        let manager = IoManager::new();
        let result = manager.convert_file(
            &junk,
            &dir.path().join("out.uvf"),
            dir.path(),
            true,
            16,
            2,
            false,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_final_converter_fallback() {
        let dir = TempDir::new().unwrap();
        let junk = dir.path().join("volume.bin");
        std::fs::write(&junk, vec![5u8; 8]).unwrap();

        let mut manager = IoManager::new();
        manager.register_final_converter(Box::new(RawConverter::with_meta(VolumeMeta::new(
            DataType::U8,
            1,
            [2, 2, 2],
        ))));

        let uvf = dir.path().join("out.uvf");
        manager
            .convert_file(&junk, &uvf, dir.path(), true, 16, 2, false)
            .unwrap();
        assert!(uvf.exists());
    }

    #[test]
    fn test_merge_incompatible_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let a = write_nrrd(dir.path(), "a.nrrd", &[0u8; 8], [2, 2, 2]);
        let b = write_nrrd(dir.path(), "b.nrrd", &[0u8; 27], [3, 3, 3]);

        let manager = IoManager::new();
        let result = manager.merge(
            &[a, b],
            &[1.0, 1.0],
            &[0.0, 0.0],
            &dir.path().join("merged.uvf"),
            dir.path(),
            false,
            true,
        );
        assert!(matches!(result, Err(Error::Incompatible(_))));
        assert!(!dir.path().join("merged.raw").exists());
    }

    #[test]
    fn test_merge_additive() {
        let dir = TempDir::new().unwrap();
        let a = write_nrrd(dir.path(), "a.nrrd", &[10u8; 8], [2, 2, 2]);
        let b = write_nrrd(dir.path(), "b.nrrd", &[20u8; 8], [2, 2, 2]);

        let manager = IoManager::new();
        let out = dir.path().join("merged.uvf");
        manager
            .merge(&[a, b], &[1.0, 1.0], &[0.0, 0.0], &out, dir.path(), false, true)
            .unwrap();

        let mut ds = UvfDataset::open(&out).unwrap();
        let voxels: Vec<u8> = ds
            .read_brick_scalars(crate::types::BrickKey::new(0, 0))
            .unwrap();
        assert!(voxels.iter().all(|&v| v == 30));
        assert!(!dir.path().join("merged.raw").exists());
    }

    #[test]
    fn test_iso_on_non_scalar_fails() {
        let dir = TempDir::new().unwrap();
        // 4-component volume via the builder directly
        let raw = dir.path().join("rgba.raw");
        std::fs::write(&raw, vec![1u8; 4 * 8]).unwrap();
        let meta = VolumeMeta::new(DataType::U8, 4, [2, 2, 2]);
        let uvf = dir.path().join("rgba.uvf");
        builder::raw_to_uvf(
            &raw,
            0,
            &meta,
            &uvf,
            dir.path(),
            &BrickingParams {
                max_brick_size: 8,
                overlap: 2,
                ..Default::default()
            },
        )
        .unwrap();

        let manager = IoManager::new();
        let mesh_target = dir.path().join("iso.obj");
        let result =
            manager.extract_isosurface(&uvf, 0, 0.5, [1.0; 4], &mesh_target, dir.path());
        assert!(result.is_err());
        assert!(!mesh_target.exists());
    }

    #[test]
    fn test_rebrick_changes_layout() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..4096).map(|v| (v % 251) as u8).collect();
        let nrrd = write_nrrd(dir.path(), "v.nrrd", &data, [16, 16, 16]);

        let manager = IoManager::new();
        let uvf = dir.path().join("v.uvf");
        manager
            .convert_file(&nrrd, &uvf, dir.path(), true, 36, 2, false)
            .unwrap();
        let bricks_before = UvfDataset::open(&uvf).unwrap().layout().total_bricks(0);

        let rebricked = dir.path().join("v2.uvf");
        manager
            .rebrick(&uvf, &rebricked, dir.path(), 12, 2, false)
            .unwrap();
        let after = UvfDataset::open(&rebricked).unwrap();
        assert!(after.layout().total_bricks(0) > bricks_before);

        // payload survives the round trip
        let a = dir.path().join("a.raw");
        let b = dir.path().join("b.raw");
        UvfDataset::open(&uvf).unwrap().export_lod(0, &a).unwrap();
        UvfDataset::open(&rebricked).unwrap().export_lod(0, &b).unwrap();
        assert_eq!(std::fs::read(&a).unwrap(), std::fs::read(&b).unwrap());
    }

    #[test]
    fn test_dialog_strings() {
        let manager = IoManager::new();
        let load = manager.load_dialog_string();
        assert!(load.starts_with("All known Files ("));
        assert!(load.contains("*.uvf"));
        assert!(load.contains("*.nrrd"));
        assert!(load.ends_with("All Files (*)"));

        let export = manager.export_dialog_string();
        assert!(export.contains("Nearly Raw Raster Data (*.nrrd);;"));
        // non-exporting converters are absent
        assert!(!export.contains("Analyze"));
    }

    #[test]
    fn test_format_lists() {
        let manager = IoManager::new();
        let import = manager.import_format_list();
        assert!(import.iter().any(|(e, _)| e == "uvf"));
        assert!(import.iter().any(|(e, _)| e == "hdr"));

        let export = manager.export_format_list();
        assert!(!export.iter().any(|(e, _)| e == "hdr"));

        let all = manager.format_list();
        assert!(all.iter().any(|(e, _, can)| e == "hdr" && !can));
    }

    #[test]
    fn test_brick_settings_validation() {
        let mut manager = IoManager::new();
        assert!(manager.set_max_brick_size(128));
        assert!(!manager.set_max_brick_size(4));
        assert!(manager.set_brick_overlap(4));
        assert!(!manager.set_brick_overlap(64));
    }

    #[test]
    fn test_verify_unknown_format() {
        let dir = TempDir::new().unwrap();
        let junk = dir.path().join("x.zzz");
        std::fs::write(&junk, b"junk").unwrap();
        let manager = IoManager::new();
        assert!(manager.needs_conversion(&junk));
        assert!(matches!(
            manager.verify(&junk),
            Err(Error::NoConverter(_))
        ));
    }
}
