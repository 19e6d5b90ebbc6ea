use argus_core::{Field, Progress};
use rayon::prelude::*;

use crate::{Error, Result};

/// Mean-shift segmentation over joint spatial/range feature vectors.
///
/// Every pixel carries the feature vector
/// `[x * spatial_scale, y * spatial_scale, f0 * scale0, ...] / window`,
/// and climbs to the density mode of a unit-radius uniform kernel in that
/// space. The lattice layout of the samples keeps the neighbour search to a
/// spatial window rather than the whole image. Converged modes within one
/// kernel radius collapse into a single segment, and segments below
/// `min_size` are merged into their most similar neighbour.
pub struct MeanShift {
    pub spatial_scale: f32,
    pub window: f32,
    /// Squared shift length below which a sample has converged.
    pub cutoff: f32,
    pub max_iter: usize,
    pub min_size: usize,
}

impl Default for MeanShift {
    fn default() -> Self {
        Self {
            spatial_scale: 1.0 / 7.0,
            window: 1.0,
            cutoff: 0.01,
            max_iter: 100,
            min_size: 20,
        }
    }
}

impl MeanShift {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_spatial_scale(mut self, scale: f32) -> Self {
        self.spatial_scale = scale;
        self
    }

    /// Scales the whole kernel; identical to dividing every feature scale
    /// by `size`.
    pub fn with_window(mut self, size: f32) -> Self {
        self.window = size;
        self
    }

    pub fn with_cutoff(mut self, change: f32, max_iter: usize) -> Self {
        self.cutoff = change;
        self.max_iter = max_iter;
        self
    }

    pub fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size;
        self
    }

    /// Segments an image given as scaled range features. Each entry pairs a
    /// channel with its scale; all channels must share one size. Returns
    /// the label field and the number of segments.
    pub fn segment(
        &self,
        features: &[(&Field<f32>, f32)],
        prog: &mut Progress,
    ) -> Result<(Field<u32>, usize)> {
        let first = features
            .first()
            .map(|(f, _)| *f)
            .ok_or_else(|| Error::InvalidParameter("no feature channels".into()))?;
        let width = first.width();
        let height = first.height();
        for (f, _) in features {
            if !f.same_size(first) {
                return Err(Error::DimensionMismatch(
                    "feature channels differ in size".into(),
                ));
            }
        }
        if self.window <= 0.0 || self.spatial_scale <= 0.0 {
            return Err(Error::InvalidParameter(
                "window and spatial scale must be positive".into(),
            ));
        }

        let dims = 2 + features.len();
        let s_sp = self.spatial_scale / self.window;
        let n = width * height;

        // Feature vectors, already scaled so the kernel radius is 1.
        let mut fv = vec![0.0f32; n * dims];
        for y in 0..height {
            for x in 0..width {
                let base = (y * width + x) * dims;
                fv[base] = x as f32 * s_sp;
                fv[base + 1] = y as f32 * s_sp;
                for (i, (f, scale)) in features.iter().enumerate() {
                    fv[base + 2 + i] = f.get(x, y) * scale / self.window;
                }
            }
        }

        prog.push();
        prog.report(0, 3);

        // Climb every sample to its mode. The spatial part of the kernel
        // bounds the candidate set to a lattice window.
        let radius_px = (1.0 / s_sp).ceil() as i64;
        let modes: Vec<f32> = {
            let fv_ref = &fv;
            let mut modes = vec![0.0f32; n * dims];
            modes
                .par_chunks_mut(dims)
                .enumerate()
                .for_each(|(p, mode)| {
                    let mut v = fv_ref[p * dims..(p + 1) * dims].to_vec();
                    let mut mean = vec![0.0f32; dims];
                    for _ in 0..self.max_iter {
                        mean.iter_mut().for_each(|m| *m = 0.0);
                        let mut count = 0usize;

                        let cx = (v[0] / s_sp).round() as i64;
                        let cy = (v[1] / s_sp).round() as i64;
                        for qy in (cy - radius_px).max(0)..=(cy + radius_px).min(height as i64 - 1)
                        {
                            for qx in
                                (cx - radius_px).max(0)..=(cx + radius_px).min(width as i64 - 1)
                            {
                                let q = qy as usize * width + qx as usize;
                                let qv = &fv_ref[q * dims..(q + 1) * dims];
                                let dist_sq: f32 = v
                                    .iter()
                                    .zip(qv)
                                    .map(|(a, b)| (a - b) * (a - b))
                                    .sum();
                                if dist_sq < 1.0 {
                                    for (m, val) in mean.iter_mut().zip(qv) {
                                        *m += val;
                                    }
                                    count += 1;
                                }
                            }
                        }
                        if count == 0 {
                            break;
                        }
                        let inv = 1.0 / count as f32;
                        let mut shift_sq = 0.0f32;
                        for (vi, m) in v.iter_mut().zip(&mean) {
                            let next = m * inv;
                            shift_sq += (next - *vi) * (next - *vi);
                            *vi = next;
                        }
                        if shift_sq < self.cutoff {
                            break;
                        }
                    }
                    mode.copy_from_slice(&v);
                });
            modes
        };

        prog.report(1, 3);

        // Link adjacent samples whose modes landed within one kernel
        // radius of each other; the connected groups are the segments.
        let mut parent: Vec<u32> = (0..n as u32).collect();
        let mode_dist_sq = |a: usize, b: usize| -> f32 {
            modes[a * dims..(a + 1) * dims]
                .iter()
                .zip(&modes[b * dims..(b + 1) * dims])
                .map(|(p, q)| (p - q) * (p - q))
                .sum()
        };
        for y in 0..height {
            for x in 0..width {
                let p = y * width + x;
                if x + 1 < width && mode_dist_sq(p, p + 1) < 1.0 {
                    union(&mut parent, p, p + 1);
                }
                if y + 1 < height && mode_dist_sq(p, p + width) < 1.0 {
                    union(&mut parent, p, p + width);
                }
            }
        }

        // Compact the union-find roots into dense labels.
        let mut root_label = vec![u32::MAX; n];
        let mut next = 0u32;
        let mut labels = vec![0u32; n];
        for p in 0..n {
            let r = find(&mut parent, p);
            if root_label[r] == u32::MAX {
                root_label[r] = next;
                next += 1;
            }
            labels[p] = root_label[r];
        }

        prog.report(2, 3);

        let mut label_field = Field::from_fn(width, height, |x, y| labels[y * width + x]);
        let count = merge_small_segments(&mut label_field, next as usize, &fv, dims, self.min_size);

        prog.pop();
        tracing::debug!(segments = count, "mean shift segmentation done");
        Ok((label_field, count))
    }
}

fn find(parent: &mut [u32], mut p: usize) -> usize {
    while parent[p] as usize != p {
        let gp = parent[parent[p] as usize];
        parent[p] = gp;
        p = gp as usize;
    }
    p
}

fn union(parent: &mut [u32], p: usize, q: usize) {
    let rp = find(parent, p);
    let rq = find(parent, q);
    if rp != rq {
        parent[rp.max(rq)] = rp.min(rq) as u32;
    }
}

/// Folds every segment smaller than `min_size` into the neighbouring
/// segment with the closest mean range features, then compacts the labels.
fn merge_small_segments(
    labels: &mut Field<u32>,
    count: usize,
    fv: &[f32],
    dims: usize,
    min_size: usize,
) -> usize {
    let width = labels.width();
    let height = labels.height();
    if min_size <= 1 || count <= 1 {
        return compact_labels(labels, count);
    }

    loop {
        let count = count_labels(labels);
        let mut sizes = vec![0usize; count];
        // Mean of the range part of the feature vector per segment.
        let range_dims = dims - 2;
        let mut sums = vec![0.0f64; count * range_dims];
        for y in 0..height {
            for x in 0..width {
                let l = *labels.get(x, y) as usize;
                sizes[l] += 1;
                let base = (y * width + x) * dims + 2;
                for i in 0..range_dims {
                    sums[l * range_dims + i] += fv[base + i] as f64;
                }
            }
        }
        let means: Vec<f64> = sums
            .iter()
            .enumerate()
            .map(|(i, s)| s / sizes[i / range_dims.max(1)].max(1) as f64)
            .collect();

        // For each small segment, the most similar adjacent segment.
        let mut target: Vec<Option<(u32, f64)>> = vec![None; count];
        for y in 0..height {
            for x in 0..width {
                let a = *labels.get(x, y) as usize;
                let mut consider = |b: u32| {
                    let b_us = b as usize;
                    if b_us == a || sizes[a] >= min_size {
                        return;
                    }
                    // Merge strictly towards bigger (or lower-numbered)
                    // segments so merge chains cannot cycle.
                    if sizes[b_us] < sizes[a] || (sizes[b_us] == sizes[a] && b_us > a) {
                        return;
                    }
                    let mut d = 0.0f64;
                    for i in 0..range_dims {
                        let diff = means[a * range_dims + i] - means[b_us * range_dims + i];
                        d += diff * diff;
                    }
                    match target[a] {
                        Some((_, best)) if best <= d => {}
                        _ => target[a] = Some((b, d)),
                    }
                };
                if x + 1 < width {
                    consider(*labels.get(x + 1, y));
                }
                if y + 1 < height {
                    consider(*labels.get(x, y + 1));
                }
                if x > 0 {
                    consider(*labels.get(x - 1, y));
                }
                if y > 0 {
                    consider(*labels.get(x, y - 1));
                }
            }
        }

        let mut changed = false;
        let remap: Vec<u32> = (0..count as u32)
            .map(|l| {
                if sizes[l as usize] < min_size {
                    if let Some((t, _)) = target[l as usize] {
                        changed = true;
                        return t;
                    }
                }
                l
            })
            .collect();
        if !changed {
            break;
        }
        for l in labels.as_mut_slice() {
            // Chase one merge step per pass; the loop handles chains.
            *l = remap[*l as usize];
        }
    }

    let count = count_labels(labels);
    compact_labels(labels, count)
}

fn count_labels(labels: &Field<u32>) -> usize {
    labels
        .as_slice()
        .iter()
        .map(|&l| l as usize + 1)
        .max()
        .unwrap_or(0)
}

/// Renumbers labels to 0..count with no gaps; returns the new count.
fn compact_labels(labels: &mut Field<u32>, count: usize) -> usize {
    let mut used = vec![false; count];
    for &l in labels.as_slice() {
        used[l as usize] = true;
    }
    let mut remap = vec![0u32; count];
    let mut next = 0u32;
    for (i, &u) in used.iter().enumerate() {
        if u {
            remap[i] = next;
            next += 1;
        }
    }
    for l in labels.as_mut_slice() {
        *l = remap[*l as usize];
    }
    next as usize
}
