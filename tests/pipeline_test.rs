//! End-to-end pipeline tests over the public API

use std::path::{Path, PathBuf};
use tempfile::TempDir;
use uvfio::converter::VolumeConverter;
use uvfio::formats::NrrdConverter;
use uvfio::geometry::MeshConverter;
use uvfio::types::BrickKey;
use uvfio::{DataType, IoManager, UvfDataset, VolumeMeta};

fn write_nrrd(dir: &Path, name: &str, meta: &VolumeMeta, payload: &[u8]) -> PathBuf {
    let raw = dir.join(format!("{}.payload", name));
    std::fs::write(&raw, payload).unwrap();
    let target = dir.join(name);
    NrrdConverter
        .convert_to_native(&raw, 0, meta, &target, true, false)
        .unwrap();
    std::fs::remove_file(&raw).unwrap();
    target
}

fn assert_no_temp_leftovers(dir: &Path) {
    let leftovers: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.contains('~') || n.contains(".tmp_raw") || n == "merged.raw")
        .collect();
    assert!(leftovers.is_empty(), "temp files left behind: {:?}", leftovers);
}

#[test]
fn scan_and_convert_image_stacks() {
    let dir = TempDir::new().unwrap();
    // two stacks distinguished by slice geometry
    for i in 0..3 {
        image::GrayImage::from_pixel(4, 4, image::Luma([10 * (i + 1) as u8]))
            .save(dir.path().join(format!("small{}.png", i)))
            .unwrap();
    }
    for i in 0..2 {
        image::GrayImage::from_pixel(8, 8, image::Luma([i as u8]))
            .save(dir.path().join(format!("large{}.png", i)))
            .unwrap();
    }

    let manager = IoManager::new();
    let mut stacks = manager.scan_directory(dir.path()).unwrap();
    assert_eq!(stacks.len(), 2);
    stacks.sort_by_key(|s| s.slice_count());

    let out_dir = TempDir::new().unwrap();
    let uvf = out_dir.path().join("stack.uvf");
    manager
        .convert_stack(&stacks[1], &uvf, out_dir.path(), 16, 2, false)
        .unwrap();

    let mut ds = UvfDataset::open(&uvf).unwrap();
    assert_eq!(ds.domain(0), [4, 4, 3]);
    let voxels: Vec<u8> = ds.read_brick_scalars(BrickKey::new(0, 0)).unwrap();
    // slices keep their scan order: 10, 20, 30
    assert_eq!(&voxels[..16], &[10u8; 16]);
    assert_eq!(&voxels[32..], &[30u8; 16]);

    assert_no_temp_leftovers(out_dir.path());
}

#[test]
fn endian_normalization_preserves_values() {
    let dir = TempDir::new().unwrap();
    // single u16 voxel 0x1234 written in big-endian byte order
    let header = b"NRRD0001\ntype: ushort\ndimension: 3\nsizes: 1 1 1\nencoding: raw\nendian: big\n\n";
    let mut bytes = header.to_vec();
    bytes.extend_from_slice(&[0x12, 0x34]);
    let nrrd = dir.path().join("be.nrrd");
    std::fs::write(&nrrd, &bytes).unwrap();

    let manager = IoManager::new();
    let uvf = dir.path().join("be.uvf");
    manager
        .convert_file(&nrrd, &uvf, dir.path(), true, 8, 2, false)
        .unwrap();

    let mut ds = UvfDataset::open(&uvf).unwrap();
    let voxels: Vec<u16> = ds.read_brick_scalars(BrickKey::new(0, 0)).unwrap();
    assert_eq!(voxels, vec![0x1234]);
    // on a little-endian host the stored bytes are swapped relative to the
    // source stream
    if cfg!(target_endian = "little") {
        assert_eq!(ds.read_brick(BrickKey::new(0, 0)).unwrap(), vec![0x34, 0x12]);
    }
    assert_no_temp_leftovers(dir.path());
}

#[test]
fn isosurface_to_obj() {
    let dir = TempDir::new().unwrap();
    let dims = [6u64, 6, 6];
    let mut payload = Vec::new();
    for z in 0..dims[2] {
        for _ in 0..dims[1] * dims[0] {
            payload.push(if z < 3 { 0u8 } else { 100 });
        }
    }
    let meta = VolumeMeta::new(DataType::U8, 1, dims);
    let nrrd = write_nrrd(dir.path(), "v.nrrd", &meta, &payload);

    let manager = IoManager::new();
    let uvf = dir.path().join("v.uvf");
    manager
        .convert_file(&nrrd, &uvf, dir.path(), true, 8, 2, false)
        .unwrap();

    let obj = dir.path().join("iso.obj");
    manager
        .extract_isosurface(&uvf, 0, 50.0, [0.0, 1.0, 0.0, 1.0], &obj, dir.path())
        .unwrap();
    assert!(obj.exists());

    let mesh = uvfio::geometry::ObjConverter.convert_to_mesh(&obj).unwrap();
    assert!(mesh.triangle_count() > 0);
    for v in &mesh.vertices {
        assert!((v[2] - 2.5).abs() < 1e-3);
    }
    assert_no_temp_leftovers(dir.path());
}

#[test]
fn expression_adds_volumes() {
    let dir = TempDir::new().unwrap();
    let manager = IoManager::new();

    let mut sources = Vec::new();
    for (name, fill) in [("a.nrrd", 10u8), ("b.nrrd", 20u8)] {
        let meta = VolumeMeta::new(DataType::U8, 1, [2, 2, 2]);
        let nrrd = write_nrrd(dir.path(), name, &meta, &[fill; 8]);
        let uvf = dir.path().join(format!("{}.uvf", name));
        manager
            .convert_file(&nrrd, &uvf, dir.path(), true, 8, 2, false)
            .unwrap();
        sources.push(uvf);
    }

    let out = dir.path().join("sum.uvf");
    manager
        .evaluate_expression("v0 + v1", &sources, &out)
        .unwrap();

    let mut ds = UvfDataset::open(&out).unwrap();
    assert_eq!(ds.data_type(), DataType::U8);
    let voxels: Vec<u8> = ds.read_brick_scalars(BrickKey::new(0, 0)).unwrap();
    assert!(voxels.iter().all(|&v| v == 30));
}

#[test]
fn merge_max_mode() {
    let dir = TempDir::new().unwrap();
    let manager = IoManager::new();

    let meta = VolumeMeta::new(DataType::U8, 1, [2, 2, 2]);
    let a = write_nrrd(dir.path(), "a.nrrd", &meta, &[40u8; 8]);
    let b = write_nrrd(dir.path(), "b.nrrd", &meta, &[15u8; 8]);

    let out = dir.path().join("merged.uvf");
    manager
        .merge(
            &[a, b],
            &[1.0, 2.0],
            &[0.0, 0.0],
            &out,
            dir.path(),
            true,
            true,
        )
        .unwrap();

    let mut ds = UvfDataset::open(&out).unwrap();
    let voxels: Vec<u8> = ds.read_brick_scalars(BrickKey::new(0, 0)).unwrap();
    // max(40, 2 * 15)
    assert!(voxels.iter().all(|&v| v == 40));
    assert_no_temp_leftovers(dir.path());
}

#[test]
fn export_lod_to_bov() {
    let dir = TempDir::new().unwrap();
    let manager = IoManager::new();

    let data: Vec<u8> = (0..64).collect();
    let meta = VolumeMeta::new(DataType::U8, 1, [4, 4, 4]);
    let nrrd = write_nrrd(dir.path(), "v.nrrd", &meta, &data);
    let uvf = dir.path().join("v.uvf");
    manager
        .convert_file(&nrrd, &uvf, dir.path(), true, 16, 2, false)
        .unwrap();

    let bov = dir.path().join("out.bov");
    manager.export_dataset(&uvf, 0, &bov, dir.path()).unwrap();
    assert!(bov.exists());

    let source = uvfio::formats::BovConverter
        .convert_to_raw(&bov, dir.path(), true)
        .unwrap();
    assert_eq!(std::fs::read(&source.path).unwrap(), data);
    assert_no_temp_leftovers(dir.path());
}

#[test]
fn analyze_reports_range() {
    let dir = TempDir::new().unwrap();
    let manager = IoManager::new();

    let meta = VolumeMeta::new(DataType::U8, 1, [2, 2, 2]);
    let nrrd = write_nrrd(dir.path(), "v.nrrd", &meta, &[5, 9, 1, 7, 3, 3, 3, 3]);

    let info = manager.analyze_dataset(&nrrd, dir.path()).unwrap();
    assert_eq!(info.range.min, 1.0);
    assert_eq!(info.range.max, 9.0);
    assert_eq!(info.domain, [2, 2, 2]);
    assert_eq!(info.component_size, 8);
}

#[test]
fn add_mesh_appends_geometry_block() {
    let dir = TempDir::new().unwrap();
    let manager = IoManager::new();

    let meta = VolumeMeta::new(DataType::U8, 1, [2, 2, 2]);
    let nrrd = write_nrrd(dir.path(), "v.nrrd", &meta, &[1u8; 8]);
    let uvf = dir.path().join("v.uvf");
    manager
        .convert_file(&nrrd, &uvf, dir.path(), true, 8, 2, false)
        .unwrap();

    // a one-triangle obj without normals
    let obj = dir.path().join("tri.obj");
    std::fs::write(&obj, "v 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\n").unwrap();

    let with_mesh = dir.path().join("withmesh.uvf");
    manager.add_mesh(&uvf, &obj, &with_mesh).unwrap();

    let mut ds = UvfDataset::open(&with_mesh).unwrap();
    let block = ds.geometry().unwrap().expect("geometry block present");
    assert_eq!(block.indices.len(), 3);
    assert_eq!(block.normals.len(), 3);
    // raster payload carried over unchanged
    assert_eq!(
        ds.read_brick(BrickKey::new(0, 0)).unwrap(),
        UvfDataset::open(&uvf)
            .unwrap()
            .read_brick(BrickKey::new(0, 0))
            .unwrap()
    );
}

#[test]
fn histograms_and_minmax_present_after_conversion() {
    let dir = TempDir::new().unwrap();
    let manager = IoManager::new();

    let data: Vec<u8> = (0..64).map(|v| v * 2).collect();
    let meta = VolumeMeta::new(DataType::U8, 1, [4, 4, 4]);
    let nrrd = write_nrrd(dir.path(), "v.nrrd", &meta, &data);
    let uvf = dir.path().join("v.uvf");
    manager
        .convert_file(&nrrd, &uvf, dir.path(), true, 16, 2, false)
        .unwrap();

    let mut ds = UvfDataset::open(&uvf).unwrap();
    let maxmin = ds.maxmin_block().unwrap().expect("min/max block");
    assert_eq!(maxmin.brick_count(), ds.brick_keys().len());
    let stats = maxmin.brick_stats(0);
    assert_eq!(stats[0].min, 0.0);
    assert_eq!(stats[0].max, 126.0);

    let h1 = ds.histogram_1d().unwrap().expect("1d histogram");
    assert_eq!(h1.bin_count(), 256);
    assert_eq!(h1.bins.iter().sum::<u64>(), 64);

    let h2 = ds.histogram_2d().unwrap().expect("2d histogram");
    assert_eq!(h2.value_bins, h1.bin_count());
    assert_eq!(h2.bins.iter().sum::<u64>(), 64);
    assert_eq!(h2.max_value, 126.0);
}
