use std::collections::HashMap;
use std::f32::consts::TAU;

use nalgebra::{Point3, Vector3};

use crate::TriMesh;

#[derive(Default)]
struct EdgeInfo {
    faces: u32,
    // Vertices opposite the edge in its (at most two) incident faces.
    opposite: Vec<usize>,
}

impl TriMesh {
    /// One round of Loop subdivision: every triangle splits into four.
    ///
    /// New edge vertices use the 3/8 + 1/8 interior mask, or the plain
    /// midpoint on boundary edges. Original vertices are smoothed with the
    /// Loop beta weights; boundary vertices only average along the boundary
    /// curve (3/4 + 1/8 + 1/8).
    pub fn subdivide(&mut self) {
        let faces_before = self.faces.len();

        let mut edges: HashMap<(usize, usize), EdgeInfo> = HashMap::new();
        for f in &self.faces {
            for k in 0..3 {
                let info = edges.entry(sorted(f[k], f[(k + 1) % 3])).or_default();
                info.faces += 1;
                info.opposite.push(f[(k + 2) % 3]);
            }
        }

        let mut neighbours: Vec<Vec<usize>> = vec![Vec::new(); self.vertices.len()];
        let mut boundary_nbrs: Vec<Vec<usize>> = vec![Vec::new(); self.vertices.len()];
        for (&(a, b), info) in &edges {
            neighbours[a].push(b);
            neighbours[b].push(a);
            if info.faces == 1 {
                boundary_nbrs[a].push(b);
                boundary_nbrs[b].push(a);
            }
        }

        // Smoothed positions for the original vertices.
        let even: Vec<Point3<f32>> = self
            .vertices
            .iter()
            .enumerate()
            .map(|(v, p)| {
                if !boundary_nbrs[v].is_empty() {
                    if boundary_nbrs[v].len() == 2 {
                        let a = self.vertices[boundary_nbrs[v][0]];
                        let b = self.vertices[boundary_nbrs[v][1]];
                        Point3::from(p.coords * 0.75 + (a.coords + b.coords) * 0.125)
                    } else {
                        // Non-manifold boundary corner: leave it alone.
                        *p
                    }
                } else {
                    let n = neighbours[v].len();
                    if n < 3 {
                        return *p;
                    }
                    let beta = loop_beta(n);
                    let mut sum = Vector3::zeros();
                    for &u in &neighbours[v] {
                        sum += self.vertices[u].coords;
                    }
                    Point3::from(p.coords * (1.0 - n as f32 * beta) + sum * beta)
                }
            })
            .collect();

        // One new vertex per edge, appended after the originals.
        let mut vertices = even;
        let mut edge_vertex: HashMap<(usize, usize), usize> = HashMap::new();
        for (&(a, b), info) in &edges {
            let pa = self.vertices[a].coords;
            let pb = self.vertices[b].coords;
            let pos = if info.faces == 2 {
                let pc = self.vertices[info.opposite[0]].coords;
                let pd = self.vertices[info.opposite[1]].coords;
                Point3::from((pa + pb) * 0.375 + (pc + pd) * 0.125)
            } else {
                Point3::from((pa + pb) * 0.5)
            };
            edge_vertex.insert((a, b), vertices.len());
            vertices.push(pos);
        }

        let mut faces = Vec::with_capacity(self.faces.len() * 4);
        for f in &self.faces {
            let eab = edge_vertex[&sorted(f[0], f[1])];
            let ebc = edge_vertex[&sorted(f[1], f[2])];
            let eca = edge_vertex[&sorted(f[2], f[0])];
            faces.push([f[0], eab, eca]);
            faces.push([f[1], ebc, eab]);
            faces.push([f[2], eca, ebc]);
            faces.push([eab, ebc, eca]);
        }

        self.vertices = vertices;
        self.faces = faces;
        tracing::debug!(
            before = faces_before,
            after = self.faces.len(),
            "subdivide done"
        );
    }
}

fn sorted(a: usize, b: usize) -> (usize, usize) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

fn loop_beta(n: usize) -> f32 {
    let c = 0.375 + 0.25 * (TAU / n as f32).cos();
    (0.625 - c * c) / n as f32
}
