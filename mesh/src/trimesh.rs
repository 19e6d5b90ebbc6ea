use std::collections::HashMap;

use nalgebra::{Point3, Vector3};

/// Indexed triangle mesh: shared vertex positions plus a face index list.
#[derive(Debug, Clone, Default)]
pub struct TriMesh {
    pub vertices: Vec<Point3<f32>>,
    pub faces: Vec<[usize; 3]>,
}

impl TriMesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(vertices: Vec<Point3<f32>>, faces: Vec<[usize; 3]>) -> Self {
        Self { vertices, faces }
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn num_faces(&self) -> usize {
        self.faces.len()
    }

    pub fn face_normals(&self) -> Vec<Vector3<f32>> {
        self.faces
            .iter()
            .map(|f| self.face_cross(f).normalize())
            .collect()
    }

    /// Area-weighted vertex normals: the raw face cross products already
    /// carry twice the face area, so summing them weights by area.
    pub fn vertex_normals(&self) -> Vec<Vector3<f32>> {
        let mut normals = vec![Vector3::zeros(); self.vertices.len()];
        for f in &self.faces {
            let cross = self.face_cross(f);
            for &v in f {
                normals[v] += cross;
            }
        }
        for n in &mut normals {
            let len = n.norm();
            if len > 1e-12 {
                *n /= len;
            }
        }
        normals
    }

    pub fn surface_area(&self) -> f32 {
        self.faces.iter().map(|f| self.face_cross(f).norm() * 0.5).sum()
    }

    pub fn bounds(&self) -> (Point3<f32>, Point3<f32>) {
        let mut min = Point3::new(f32::INFINITY, f32::INFINITY, f32::INFINITY);
        let mut max = Point3::new(f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY);
        for v in &self.vertices {
            for i in 0..3 {
                min[i] = min[i].min(v[i]);
                max[i] = max[i].max(v[i]);
            }
        }
        (min, max)
    }

    fn face_cross(&self, f: &[usize; 3]) -> Vector3<f32> {
        let e1 = self.vertices[f[1]] - self.vertices[f[0]];
        let e2 = self.vertices[f[2]] - self.vertices[f[0]];
        e1.cross(&e2)
    }

    /// Merges vertices closer than `range` through a spatial hash, rewrites
    /// the face indices, drops faces that collapse to a line or point, and
    /// compacts unused vertices away. Returns how many vertices were
    /// removed.
    pub fn weld(&mut self, range: f32) -> usize {
        let before = self.vertices.len();
        let cell = range.max(1e-12);
        let key = |p: &Point3<f32>| -> (i64, i64, i64) {
            (
                (p.x / cell).floor() as i64,
                (p.y / cell).floor() as i64,
                (p.z / cell).floor() as i64,
            )
        };

        // First surviving vertex within range wins; later duplicates map
        // onto it.
        let mut grid: HashMap<(i64, i64, i64), Vec<usize>> = HashMap::new();
        let mut remap = vec![usize::MAX; before];
        let mut kept: Vec<Point3<f32>> = Vec::new();
        for (i, p) in self.vertices.iter().enumerate() {
            let (kx, ky, kz) = key(p);
            let mut found = None;
            'search: for dx in -1..=1 {
                for dy in -1..=1 {
                    for dz in -1..=1 {
                        if let Some(bucket) = grid.get(&(kx + dx, ky + dy, kz + dz)) {
                            for &j in bucket {
                                if (kept[j] - p).norm() <= range {
                                    found = Some(j);
                                    break 'search;
                                }
                            }
                        }
                    }
                }
            }
            remap[i] = match found {
                Some(j) => j,
                None => {
                    kept.push(*p);
                    let j = kept.len() - 1;
                    grid.entry((kx, ky, kz)).or_default().push(j);
                    j
                }
            };
        }

        self.faces.retain_mut(|f| {
            for v in f.iter_mut() {
                *v = remap[*v];
            }
            f[0] != f[1] && f[1] != f[2] && f[0] != f[2]
        });

        // Drop vertices no face references any more.
        let mut used = vec![false; kept.len()];
        for f in &self.faces {
            for &v in f {
                used[v] = true;
            }
        }
        let mut compact = vec![usize::MAX; kept.len()];
        let mut vertices = Vec::new();
        for (i, p) in kept.into_iter().enumerate() {
            if used[i] {
                compact[i] = vertices.len();
                vertices.push(p);
            }
        }
        for f in &mut self.faces {
            for v in f.iter_mut() {
                *v = compact[*v];
            }
        }

        self.vertices = vertices;
        tracing::debug!(
            removed = before - self.vertices.len(),
            vertices = self.vertices.len(),
            "weld done"
        );
        before - self.vertices.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Unit cube as triangle soup: every face carries its own vertices.
    pub(crate) fn cube_soup() -> TriMesh {
        let c = |x: f32, y: f32, z: f32| Point3::new(x, y, z);
        // Wound so every face normal points out of the cube.
        let quads = [
            [c(0., 0., 0.), c(0., 1., 0.), c(1., 1., 0.), c(1., 0., 0.)],
            [c(0., 0., 1.), c(1., 0., 1.), c(1., 1., 1.), c(0., 1., 1.)],
            [c(0., 0., 0.), c(1., 0., 0.), c(1., 0., 1.), c(0., 0., 1.)],
            [c(0., 1., 0.), c(0., 1., 1.), c(1., 1., 1.), c(1., 1., 0.)],
            [c(0., 0., 0.), c(0., 0., 1.), c(0., 1., 1.), c(0., 1., 0.)],
            [c(1., 0., 0.), c(1., 1., 0.), c(1., 1., 1.), c(1., 0., 1.)],
        ];
        let mut mesh = TriMesh::new();
        for q in quads {
            let base = mesh.vertices.len();
            mesh.vertices.extend_from_slice(&q);
            mesh.faces.push([base, base + 1, base + 2]);
            mesh.faces.push([base, base + 2, base + 3]);
        }
        mesh
    }

    #[test]
    fn test_weld_cube_soup() {
        let mut mesh = cube_soup();
        assert_eq!(mesh.num_vertices(), 24);
        let removed = mesh.weld(1e-6);
        assert_eq!(removed, 16);
        assert_eq!(mesh.num_vertices(), 8);
        assert_eq!(mesh.num_faces(), 12);
        assert!((mesh.surface_area() - 6.0).abs() < 1e-5);
    }

    #[test]
    fn test_weld_drops_degenerate_faces() {
        let mut mesh = TriMesh::from_parts(
            vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(0.0, 0.0, 0.001),
                Point3::new(1.0, 0.0, 0.0),
            ],
            vec![[0, 1, 2]],
        );
        mesh.weld(0.01);
        assert_eq!(mesh.num_faces(), 0);
        assert_eq!(mesh.num_vertices(), 0);
    }

    #[test]
    fn test_vertex_normals_point_outward() {
        let mut mesh = cube_soup();
        mesh.weld(1e-6);
        let normals = mesh.vertex_normals();
        let centre = Point3::new(0.5, 0.5, 0.5);
        for (v, n) in mesh.vertices.iter().zip(&normals) {
            assert!((n.norm() - 1.0).abs() < 1e-5);
            assert!(n.dot(&(v - centre)) > 0.0, "normal points inward at {:?}", v);
        }
    }

    #[test]
    fn test_bounds() {
        let mesh = cube_soup();
        let (min, max) = mesh.bounds();
        assert_eq!(min, Point3::new(0.0, 0.0, 0.0));
        assert_eq!(max, Point3::new(1.0, 1.0, 1.0));
    }
}
