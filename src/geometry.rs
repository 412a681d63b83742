//! Triangle meshes and mesh-format converters

use crate::error::{Error, Result};
use crate::util::{extension, file_name};
use crate::uvf::GeometryBlock;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// An indexed triangle mesh with optional per-vertex normals and colors
#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub name: String,
    pub vertices: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub colors: Vec<[f32; 4]>,
    pub indices: Vec<u32>,
}

impl Mesh {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Append one triangle with per-vertex normals and a uniform color
    pub fn push_triangle(&mut self, verts: [[f32; 3]; 3], normals: [[f32; 3]; 3], color: [f32; 4]) {
        let base = self.vertices.len() as u32;
        self.vertices.extend_from_slice(&verts);
        self.normals.extend_from_slice(&normals);
        self.colors.extend_from_slice(&[color; 3]);
        self.indices.extend_from_slice(&[base, base + 1, base + 2]);
    }

    /// Replace the normals with area-weighted face normals accumulated per
    /// vertex
    pub fn recompute_normals(&mut self) {
        let mut acc = vec![[0.0f32; 3]; self.vertices.len()];
        for tri in self.indices.chunks_exact(3) {
            let a = self.vertices[tri[0] as usize];
            let b = self.vertices[tri[1] as usize];
            let c = self.vertices[tri[2] as usize];
            let ab = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
            let ac = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];
            let n = [
                ab[1] * ac[2] - ab[2] * ac[1],
                ab[2] * ac[0] - ab[0] * ac[2],
                ab[0] * ac[1] - ab[1] * ac[0],
            ];
            for &i in tri {
                let v = &mut acc[i as usize];
                v[0] += n[0];
                v[1] += n[1];
                v[2] += n[2];
            }
        }
        for v in &mut acc {
            let len = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
            if len > 0.0 {
                v[0] /= len;
                v[1] /= len;
                v[2] /= len;
            }
        }
        self.normals = acc;
    }

    pub fn to_block(&self) -> GeometryBlock {
        GeometryBlock {
            desc: self.name.clone(),
            vertices: self.vertices.clone(),
            normals: self.normals.clone(),
            colors: self.colors.clone(),
            indices: self.indices.clone(),
        }
    }

    pub fn from_block(block: &GeometryBlock) -> Self {
        Self {
            name: block.desc.clone(),
            vertices: block.vertices.clone(),
            normals: block.normals.clone(),
            colors: block.colors.clone(),
            indices: block.indices.clone(),
        }
    }
}

pub trait MeshConverter {
    fn description(&self) -> &str;
    fn extensions(&self) -> &[&str];
    fn can_export(&self) -> bool;

    fn can_read(&self, path: &Path) -> bool {
        let ext = extension(path);
        self.extensions().contains(&ext.as_str())
    }

    fn convert_to_mesh(&self, path: &Path) -> Result<Mesh>;
    fn convert_to_native(&self, mesh: &Mesh, target: &Path) -> Result<()>;
}

/// Wavefront OBJ reader/writer
pub struct ObjConverter;

impl MeshConverter for ObjConverter {
    fn description(&self) -> &str {
        "Wavefront Object"
    }

    fn extensions(&self) -> &[&str] {
        &["obj"]
    }

    fn can_export(&self) -> bool {
        true
    }

    fn convert_to_mesh(&self, path: &Path) -> Result<Mesh> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| Error::Open(path.display().to_string()))?;

        let mut mesh = Mesh::new(file_name(path));
        let mut normals: Vec<[f32; 3]> = Vec::new();
        let mut normal_of_vertex: Vec<Option<usize>> = Vec::new();

        for line in text.lines() {
            let mut tokens = line.split_whitespace();
            match tokens.next() {
                Some("v") => {
                    let coords: Vec<f32> = tokens.filter_map(|t| t.parse().ok()).collect();
                    if coords.len() < 3 {
                        return Err(Error::Format(format!(
                            "{}: malformed vertex line",
                            path.display()
                        )));
                    }
                    mesh.vertices.push([coords[0], coords[1], coords[2]]);
                    normal_of_vertex.push(None);
                    // a fourth..seventh number is a vertex color extension
                    if coords.len() >= 6 {
                        mesh.colors.push([coords[3], coords[4], coords[5], 1.0]);
                    }
                }
                Some("vn") => {
                    let coords: Vec<f32> = tokens.filter_map(|t| t.parse().ok()).collect();
                    if coords.len() >= 3 {
                        normals.push([coords[0], coords[1], coords[2]]);
                    }
                }
                Some("f") => {
                    let mut face: Vec<u32> = Vec::new();
                    for token in tokens {
                        let mut parts = token.split('/');
                        let vi: i64 = parts
                            .next()
                            .and_then(|p| p.parse().ok())
                            .ok_or_else(|| {
                                Error::Format(format!("{}: malformed face line", path.display()))
                            })?;
                        let vertex = resolve_index(vi, mesh.vertices.len()).ok_or_else(|| {
                            Error::Format(format!("{}: face index out of range", path.display()))
                        })?;
                        // texture index (ignored), then normal index
                        let _ = parts.next();
                        if let Some(ni) = parts.next().and_then(|p| p.parse::<i64>().ok()) {
                            if let Some(n) = resolve_index(ni, normals.len()) {
                                normal_of_vertex[vertex as usize] = Some(n as usize);
                            }
                        }
                        face.push(vertex);
                    }
                    // triangulate as a fan
                    for i in 1..face.len().saturating_sub(1) {
                        mesh.indices
                            .extend_from_slice(&[face[0], face[i], face[i + 1]]);
                    }
                }
                _ => {}
            }
        }

        if !normals.is_empty() && normal_of_vertex.iter().all(|n| n.is_some()) {
            mesh.normals = normal_of_vertex
                .iter()
                .map(|n| normals[n.unwrap()])
                .collect();
        }
        Ok(mesh)
    }

    fn convert_to_native(&self, mesh: &Mesh, target: &Path) -> Result<()> {
        let mut out = BufWriter::new(
            File::create(target)
                .map_err(|e| Error::Write(format!("{}: {}", target.display(), e)))?,
        );
        writeln!(out, "# {}", mesh.name)?;
        let with_colors = mesh.colors.len() == mesh.vertices.len();
        for (i, v) in mesh.vertices.iter().enumerate() {
            if with_colors {
                let c = mesh.colors[i];
                writeln!(out, "v {} {} {} {} {} {}", v[0], v[1], v[2], c[0], c[1], c[2])?;
            } else {
                writeln!(out, "v {} {} {}", v[0], v[1], v[2])?;
            }
        }
        let with_normals = mesh.normals.len() == mesh.vertices.len();
        if with_normals {
            for n in &mesh.normals {
                writeln!(out, "vn {} {} {}", n[0], n[1], n[2])?;
            }
        }
        for tri in mesh.indices.chunks_exact(3) {
            if with_normals {
                writeln!(
                    out,
                    "f {0}//{0} {1}//{1} {2}//{2}",
                    tri[0] + 1,
                    tri[1] + 1,
                    tri[2] + 1
                )?;
            } else {
                writeln!(out, "f {} {} {}", tri[0] + 1, tri[1] + 1, tri[2] + 1)?;
            }
        }
        out.flush()?;
        Ok(())
    }
}

fn resolve_index(index: i64, count: usize) -> Option<u32> {
    if index > 0 && (index as usize) <= count {
        Some((index - 1) as u32)
    } else if index < 0 && (-index as usize) <= count {
        Some((count as i64 + index) as u32)
    } else {
        None
    }
}

/// Stanford PLY (ascii) reader/writer
pub struct PlyConverter;

impl MeshConverter for PlyConverter {
    fn description(&self) -> &str {
        "Stanford Polygon File"
    }

    fn extensions(&self) -> &[&str] {
        &["ply"]
    }

    fn can_export(&self) -> bool {
        true
    }

    fn convert_to_mesh(&self, path: &Path) -> Result<Mesh> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| Error::Open(path.display().to_string()))?;
        let mut lines = text.lines();

        if lines.next().map(str::trim) != Some("ply") {
            return Err(Error::Format(format!("{}: missing ply magic", path.display())));
        }

        let mut vertex_count = 0usize;
        let mut face_count = 0usize;
        let mut vertex_props: Vec<String> = Vec::new();
        let mut in_vertex_element = false;
        for line in lines.by_ref() {
            let line = line.trim();
            if line == "end_header" {
                break;
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            match tokens.as_slice() {
                ["format", kind, _] => {
                    if *kind != "ascii" {
                        return Err(Error::UnsupportedType(format!(
                            "{}: only ascii PLY is supported",
                            path.display()
                        )));
                    }
                }
                ["element", "vertex", n] => {
                    vertex_count = n.parse().unwrap_or(0);
                    in_vertex_element = true;
                }
                ["element", "face", n] => {
                    face_count = n.parse().unwrap_or(0);
                    in_vertex_element = false;
                }
                ["element", ..] => in_vertex_element = false,
                ["property", _, name] if in_vertex_element => {
                    vertex_props.push((*name).to_string());
                }
                _ => {}
            }
        }

        let prop_index = |name: &str| vertex_props.iter().position(|p| p == name);
        let (px, py, pz) = match (prop_index("x"), prop_index("y"), prop_index("z")) {
            (Some(x), Some(y), Some(z)) => (x, y, z),
            _ => {
                return Err(Error::Format(format!(
                    "{}: vertex element lacks x/y/z",
                    path.display()
                )))
            }
        };
        let normal_idx = (prop_index("nx"), prop_index("ny"), prop_index("nz"));

        let mut mesh = Mesh::new(file_name(path));
        for _ in 0..vertex_count {
            let line = lines
                .next()
                .ok_or_else(|| Error::Format(format!("{}: truncated vertex list", path.display())))?;
            let values: Vec<f32> = line
                .split_whitespace()
                .filter_map(|t| t.parse().ok())
                .collect();
            if values.len() < vertex_props.len() {
                return Err(Error::Format(format!(
                    "{}: malformed vertex line",
                    path.display()
                )));
            }
            mesh.vertices.push([values[px], values[py], values[pz]]);
            if let (Some(nx), Some(ny), Some(nz)) = normal_idx {
                mesh.normals.push([values[nx], values[ny], values[nz]]);
            }
        }
        for _ in 0..face_count {
            let line = lines
                .next()
                .ok_or_else(|| Error::Format(format!("{}: truncated face list", path.display())))?;
            let values: Vec<u32> = line
                .split_whitespace()
                .filter_map(|t| t.parse().ok())
                .collect();
            if values.is_empty() || values.len() != values[0] as usize + 1 {
                return Err(Error::Format(format!(
                    "{}: malformed face line",
                    path.display()
                )));
            }
            let face = &values[1..];
            for i in 1..face.len().saturating_sub(1) {
                mesh.indices
                    .extend_from_slice(&[face[0], face[i], face[i + 1]]);
            }
        }
        Ok(mesh)
    }

    fn convert_to_native(&self, mesh: &Mesh, target: &Path) -> Result<()> {
        let mut out = BufWriter::new(
            File::create(target)
                .map_err(|e| Error::Write(format!("{}: {}", target.display(), e)))?,
        );
        let with_normals = mesh.normals.len() == mesh.vertices.len();
        let with_colors = mesh.colors.len() == mesh.vertices.len();

        writeln!(out, "ply")?;
        writeln!(out, "format ascii 1.0")?;
        writeln!(out, "comment {}", mesh.name)?;
        writeln!(out, "element vertex {}", mesh.vertices.len())?;
        writeln!(out, "property float x")?;
        writeln!(out, "property float y")?;
        writeln!(out, "property float z")?;
        if with_normals {
            writeln!(out, "property float nx")?;
            writeln!(out, "property float ny")?;
            writeln!(out, "property float nz")?;
        }
        if with_colors {
            writeln!(out, "property uchar red")?;
            writeln!(out, "property uchar green")?;
            writeln!(out, "property uchar blue")?;
            writeln!(out, "property uchar alpha")?;
        }
        writeln!(out, "element face {}", mesh.triangle_count())?;
        writeln!(out, "property list uchar int vertex_indices")?;
        writeln!(out, "end_header")?;

        for (i, v) in mesh.vertices.iter().enumerate() {
            write!(out, "{} {} {}", v[0], v[1], v[2])?;
            if with_normals {
                let n = mesh.normals[i];
                write!(out, " {} {} {}", n[0], n[1], n[2])?;
            }
            if with_colors {
                let c = mesh.colors[i];
                write!(
                    out,
                    " {} {} {} {}",
                    (c[0] * 255.0).clamp(0.0, 255.0) as u8,
                    (c[1] * 255.0).clamp(0.0, 255.0) as u8,
                    (c[2] * 255.0).clamp(0.0, 255.0) as u8,
                    (c[3] * 255.0).clamp(0.0, 255.0) as u8
                )?;
            }
            writeln!(out)?;
        }
        for tri in mesh.indices.chunks_exact(3) {
            writeln!(out, "3 {} {} {}", tri[0], tri[1], tri[2])?;
        }
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn unit_triangle() -> Mesh {
        let mut mesh = Mesh::new("tri");
        mesh.push_triangle(
            [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            [[0.0, 0.0, 1.0]; 3],
            [1.0, 0.0, 0.0, 1.0],
        );
        mesh
    }

    #[test]
    fn test_obj_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.obj");
        let mesh = unit_triangle();
        ObjConverter.convert_to_native(&mesh, &path).unwrap();

        let back = ObjConverter.convert_to_mesh(&path).unwrap();
        assert_eq!(back.vertices, mesh.vertices);
        assert_eq!(back.indices, mesh.indices);
        assert_eq!(back.normals, mesh.normals);
    }

    #[test]
    fn test_ply_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.ply");
        let mesh = unit_triangle();
        PlyConverter.convert_to_native(&mesh, &path).unwrap();

        let back = PlyConverter.convert_to_mesh(&path).unwrap();
        assert_eq!(back.vertices, mesh.vertices);
        assert_eq!(back.indices, mesh.indices);
        assert_eq!(back.normals, mesh.normals);
    }

    #[test]
    fn test_recompute_normals() {
        let mut mesh = unit_triangle();
        mesh.normals.clear();
        mesh.recompute_normals();
        assert_eq!(mesh.normals.len(), 3);
        for n in &mesh.normals {
            assert!((n[2] - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_can_read_by_extension() {
        assert!(ObjConverter.can_read(Path::new("mesh.OBJ")));
        assert!(!ObjConverter.can_read(Path::new("mesh.ply")));
        assert!(PlyConverter.can_read(Path::new("mesh.ply")));
    }

    #[test]
    fn test_block_round_trip() {
        let mesh = unit_triangle();
        let block = mesh.to_block();
        let back = Mesh::from_block(&block);
        assert_eq!(back.vertices, mesh.vertices);
        assert_eq!(back.colors, mesh.colors);
    }
}
