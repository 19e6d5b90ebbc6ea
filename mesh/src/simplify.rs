use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use nalgebra::{Matrix4, Point3, Vector3, Vector4};

use crate::TriMesh;

/// An edge collapse waiting in the cost heap. Generation stamps detect
/// entries that went stale when one of their endpoints moved or merged.
struct Candidate {
    cost: f64,
    a: usize,
    b: usize,
    gen_a: u32,
    gen_b: u32,
    pos: Point3<f32>,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cost == other.cost
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    // Reversed so the BinaryHeap pops the cheapest collapse first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.cost.total_cmp(&self.cost)
    }
}

impl TriMesh {
    /// Quadric-error edge collapse down to at most `target_tris` triangles.
    ///
    /// Every vertex accumulates the plane quadrics of its incident faces;
    /// each edge is scored by the cheapest of its two endpoints and their
    /// midpoint under the summed quadric. Collapses that would flip or
    /// squash a surviving triangle are rejected, so the loop can stop above
    /// the target when nothing safe is left.
    pub fn simplify(&mut self, target_tris: usize) {
        if self.faces.len() <= target_tris {
            return;
        }
        let before = self.faces.len();

        let mut positions = std::mem::take(&mut self.vertices);
        let mut faces = std::mem::take(&mut self.faces);
        let mut alive = vec![true; faces.len()];
        let mut alive_count = faces.len();

        let mut quadrics = vec![Matrix4::<f64>::zeros(); positions.len()];
        for f in &faces {
            if let Some(plane) = face_plane(&positions, f) {
                let k = plane * plane.transpose();
                for &v in f {
                    quadrics[v] += k;
                }
            }
        }

        let mut incident: Vec<Vec<usize>> = vec![Vec::new(); positions.len()];
        for (fi, f) in faces.iter().enumerate() {
            for &v in f {
                incident[v].push(fi);
            }
        }

        let mut generation = vec![0u32; positions.len()];
        let mut heap = BinaryHeap::new();
        let mut seeded = HashSet::new();
        for f in &faces {
            for k in 0..3 {
                let (a, b) = sorted(f[k], f[(k + 1) % 3]);
                if seeded.insert((a, b)) {
                    push_candidate(&mut heap, &positions, &quadrics, &generation, a, b);
                }
            }
        }

        while alive_count > target_tris {
            let Some(c) = heap.pop() else { break };
            if generation[c.a] != c.gen_a || generation[c.b] != c.gen_b {
                continue;
            }
            if !collapse_is_safe(&c, &positions, &faces, &alive, &incident) {
                continue;
            }

            positions[c.a] = c.pos;
            let qb = quadrics[c.b];
            quadrics[c.a] += qb;
            for fi in std::mem::take(&mut incident[c.b]) {
                if !alive[fi] {
                    continue;
                }
                if faces[fi].contains(&c.a) {
                    alive[fi] = false;
                    alive_count -= 1;
                } else {
                    for v in faces[fi].iter_mut() {
                        if *v == c.b {
                            *v = c.a;
                        }
                    }
                    incident[c.a].push(fi);
                }
            }
            generation[c.a] += 1;
            generation[c.b] += 1;

            let mut neighbours = HashSet::new();
            for &fi in &incident[c.a] {
                if !alive[fi] {
                    continue;
                }
                for &v in &faces[fi] {
                    if v != c.a {
                        neighbours.insert(v);
                    }
                }
            }
            for b in neighbours {
                push_candidate(&mut heap, &positions, &quadrics, &generation, c.a, b);
            }
        }

        // Compact the surviving faces and the vertices they reference.
        let mut vmap = vec![usize::MAX; positions.len()];
        for (fi, f) in faces.iter().enumerate() {
            if !alive[fi] {
                continue;
            }
            let mut nf = [0usize; 3];
            for (k, &v) in f.iter().enumerate() {
                if vmap[v] == usize::MAX {
                    vmap[v] = self.vertices.len();
                    self.vertices.push(positions[v]);
                }
                nf[k] = vmap[v];
            }
            self.faces.push(nf);
        }

        tracing::debug!(before, after = self.faces.len(), "simplify done");
    }
}

fn sorted(a: usize, b: usize) -> (usize, usize) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

fn face_plane(positions: &[Point3<f32>], f: &[usize; 3]) -> Option<Vector4<f64>> {
    let p0 = positions[f[0]].cast::<f64>();
    let e1 = positions[f[1]].cast::<f64>() - p0;
    let e2 = positions[f[2]].cast::<f64>() - p0;
    let n = e1.cross(&e2);
    let len = n.norm();
    if len < 1e-12 {
        return None;
    }
    let n = n / len;
    Some(Vector4::new(n.x, n.y, n.z, -n.dot(&p0.coords)))
}

fn quadric_cost(q: &Matrix4<f64>, p: &Point3<f32>) -> f64 {
    let v = Vector4::new(p.x as f64, p.y as f64, p.z as f64, 1.0);
    (q * v).dot(&v)
}

fn push_candidate(
    heap: &mut BinaryHeap<Candidate>,
    positions: &[Point3<f32>],
    quadrics: &[Matrix4<f64>],
    generation: &[u32],
    a: usize,
    b: usize,
) {
    let q = quadrics[a] + quadrics[b];
    let mid = Point3::from((positions[a].coords + positions[b].coords) * 0.5);
    let mut best_pos = positions[a];
    let mut best_cost = quadric_cost(&q, &best_pos);
    for p in [positions[b], mid] {
        let cost = quadric_cost(&q, &p);
        if cost < best_cost {
            best_cost = cost;
            best_pos = p;
        }
    }
    heap.push(Candidate {
        cost: best_cost,
        a,
        b,
        gen_a: generation[a],
        gen_b: generation[b],
        pos: best_pos,
    });
}

/// A collapse is safe when every face that survives it keeps a sensible
/// normal: not near-zero area and not flipped relative to its current
/// orientation.
fn collapse_is_safe(
    c: &Candidate,
    positions: &[Point3<f32>],
    faces: &[[usize; 3]],
    alive: &[bool],
    incident: &[Vec<usize>],
) -> bool {
    for &(v, other) in &[(c.a, c.b), (c.b, c.a)] {
        for &fi in &incident[v] {
            if !alive[fi] {
                continue;
            }
            let f = faces[fi];
            if f.contains(&other) {
                // Shared face: removed by the collapse itself.
                continue;
            }
            let old = tri_cross(f.map(|u| positions[u]));
            let new = tri_cross(f.map(|u| if u == v { c.pos } else { positions[u] }));
            if new.norm_squared() < 1e-18 || old.dot(&new) <= 0.0 {
                return false;
            }
        }
    }
    true
}

fn tri_cross(p: [Point3<f32>; 3]) -> Vector3<f64> {
    let p0 = p[0].cast::<f64>();
    let e1 = p[1].cast::<f64>() - p0;
    let e2 = p[2].cast::<f64>() - p0;
    e1.cross(&e2)
}
