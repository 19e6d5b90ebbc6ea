use argus_core::{Field, Progress};
use rayon::prelude::*;

use crate::{Error, Result};

/// A scale-space keypoint in original-image coordinates.
#[derive(Debug, Clone, Copy)]
pub struct KeyPoint {
    pub x: f32,
    pub y: f32,
    /// Scale in pixels of the original image.
    pub scale: f32,
    /// Dominant gradient orientation, radians in [0, 2pi).
    pub orientation: f32,
    /// Absolute DoG response at the extremum.
    pub response: f32,
    pub octave: usize,
    pub layer: usize,
}

pub const DESCRIPTOR_LEN: usize = 128;

/// SIFT detector/descriptor over a difference-of-Gaussians pyramid.
pub struct Sift {
    pub n_octaves: usize,
    pub n_layers: usize,
    pub sigma: f32,
    pub contrast_threshold: f32,
    pub edge_threshold: f32,
}

impl Default for Sift {
    fn default() -> Self {
        Self {
            n_octaves: 4,
            n_layers: 3,
            sigma: 1.6,
            contrast_threshold: 0.04,
            edge_threshold: 10.0,
        }
    }
}

impl Sift {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_octaves(mut self, n_octaves: usize) -> Self {
        self.n_octaves = n_octaves;
        self
    }

    pub fn with_layers(mut self, n_layers: usize) -> Self {
        self.n_layers = n_layers;
        self
    }

    pub fn with_contrast_threshold(mut self, threshold: f32) -> Self {
        self.contrast_threshold = threshold;
        self
    }

    pub fn detect(&self, image: &Field<f32>, prog: &mut Progress) -> Result<Vec<KeyPoint>> {
        let (keypoints, _) = self.detect_impl(image, prog)?;
        Ok(keypoints)
    }

    /// Detects keypoints and computes their 128-float descriptors.
    pub fn detect_and_describe(
        &self,
        image: &Field<f32>,
        prog: &mut Progress,
    ) -> Result<(Vec<KeyPoint>, Vec<[f32; DESCRIPTOR_LEN]>)> {
        let (keypoints, pyramid) = self.detect_impl(image, prog)?;
        let descriptors = keypoints
            .par_iter()
            .map(|kp| describe(&pyramid[kp.octave][kp.layer], kp))
            .collect();
        Ok((keypoints, descriptors))
    }

    fn detect_impl(
        &self,
        image: &Field<f32>,
        prog: &mut Progress,
    ) -> Result<(Vec<KeyPoint>, Vec<Vec<Field<f32>>>)> {
        if self.n_layers == 0 || self.n_octaves == 0 {
            return Err(Error::InvalidParameter(
                "need at least one octave and one layer".into(),
            ));
        }
        if image.width() < 16 || image.height() < 16 {
            return Err(Error::InvalidParameter("image too small for SIFT".into()));
        }

        prog.push();
        prog.report(0, 3);
        let pyramid = self.build_scale_space(image);
        prog.report(1, 3);
        let dog = compute_dog(&pyramid);
        prog.report(2, 3);

        let k = 2.0f32.powf(1.0 / self.n_layers as f32);
        let mut keypoints = Vec::new();
        for (o, dog_octave) in dog.iter().enumerate() {
            let octave_scale = (1usize << o) as f32;
            for layer in 1..=self.n_layers {
                let below = &dog_octave[layer - 1];
                let here = &dog_octave[layer];
                let above = &dog_octave[layer + 1];
                let kp_sigma = self.sigma * k.powi(layer as i32);

                for y in 1..here.height() - 1 {
                    for x in 1..here.width() - 1 {
                        let v = *here.get(x, y);
                        if v.abs() < self.contrast_threshold {
                            continue;
                        }
                        if !is_extremum(below, here, above, x, y, v) {
                            continue;
                        }
                        if self.on_edge(here, x, y) {
                            continue;
                        }

                        for orientation in orientations(&pyramid[o][layer], x, y, kp_sigma) {
                            keypoints.push(KeyPoint {
                                x: x as f32 * octave_scale,
                                y: y as f32 * octave_scale,
                                scale: kp_sigma * octave_scale,
                                orientation,
                                response: v.abs(),
                                octave: o,
                                layer,
                            });
                        }
                    }
                }
            }
        }
        prog.pop();
        tracing::debug!(count = keypoints.len(), "SIFT keypoints detected");
        Ok((keypoints, pyramid))
    }

    fn build_scale_space(&self, image: &Field<f32>) -> Vec<Vec<Field<f32>>> {
        // Stop subdividing once an octave gets too small to hold the
        // extremum and descriptor stencils.
        let octaves = {
            let mut o = 1usize;
            let (mut w, mut h) = (image.width(), image.height());
            while o < self.n_octaves && w / 2 >= 16 && h / 2 >= 16 {
                o += 1;
                w /= 2;
                h /= 2;
            }
            o
        };

        let k = 2.0f32.powf(1.0 / self.n_layers as f32);
        let mut pyramid: Vec<Vec<Field<f32>>> = Vec::with_capacity(octaves);
        let mut base = image.clone();
        for o in 0..octaves {
            let mut layers = Vec::with_capacity(self.n_layers + 3);
            let mut sig = self.sigma;
            layers.push(gaussian_blur(&base, sig));
            for _ in 1..self.n_layers + 3 {
                let sig_prev = sig;
                sig *= k;
                // Incremental blur: applying sig_total on top of sig_prev
                // yields a total blur of sig.
                let sig_total = (sig * sig - sig_prev * sig_prev).sqrt();
                let blurred = gaussian_blur(layers.last().unwrap_or(&base), sig_total);
                layers.push(blurred);
            }
            if o + 1 < octaves {
                base = downsample(&layers[self.n_layers]);
            }
            pyramid.push(layers);
        }
        pyramid
    }

    /// Edge rejection via the ratio of principal curvatures of the DoG
    /// surface.
    fn on_edge(&self, dog: &Field<f32>, x: usize, y: usize) -> bool {
        let v = *dog.get(x, y);
        let dxx = dog.get(x + 1, y) + dog.get(x - 1, y) - 2.0 * v;
        let dyy = dog.get(x, y + 1) + dog.get(x, y - 1) - 2.0 * v;
        let dxy = 0.25
            * (dog.get(x + 1, y + 1) + dog.get(x - 1, y - 1)
                - dog.get(x + 1, y - 1)
                - dog.get(x - 1, y + 1));
        let trace = dxx + dyy;
        let det = dxx * dyy - dxy * dxy;
        if det <= 0.0 {
            return true;
        }
        let r = self.edge_threshold;
        trace * trace / det >= (r + 1.0) * (r + 1.0) / r
    }
}

fn compute_dog(pyramid: &[Vec<Field<f32>>]) -> Vec<Vec<Field<f32>>> {
    pyramid
        .iter()
        .map(|layers| {
            (0..layers.len() - 1)
                .map(|i| {
                    Field::from_fn(layers[i].width(), layers[i].height(), |x, y| {
                        layers[i + 1].get(x, y) - layers[i].get(x, y)
                    })
                })
                .collect()
        })
        .collect()
}

fn is_extremum(
    below: &Field<f32>,
    here: &Field<f32>,
    above: &Field<f32>,
    x: usize,
    y: usize,
    v: f32,
) -> bool {
    let mut max = true;
    let mut min = true;
    for field in [below, here, above] {
        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                if std::ptr::eq(field, here) && dx == 0 && dy == 0 {
                    continue;
                }
                let n = *field.get((x as i64 + dx) as usize, (y as i64 + dy) as usize);
                max &= v > n;
                min &= v < n;
                if !max && !min {
                    return false;
                }
            }
        }
    }
    max || min
}

/// Dominant orientations from a 36-bin gradient histogram around the
/// keypoint. Peaks within 80% of the strongest each yield an orientation.
fn orientations(gauss: &Field<f32>, x: usize, y: usize, kp_sigma: f32) -> Vec<f32> {
    const BINS: usize = 36;
    let weight_sigma = 1.5 * kp_sigma;
    let radius = (4.5 * kp_sigma).round().max(1.0) as i64;

    let mut hist = [0.0f32; BINS];
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let px = x as i64 + dx;
            let py = y as i64 + dy;
            if px < 1 || py < 1 || px >= gauss.width() as i64 - 1 || py >= gauss.height() as i64 - 1
            {
                continue;
            }
            let (px, py) = (px as usize, py as usize);
            let gx = gauss.get(px + 1, py) - gauss.get(px - 1, py);
            let gy = gauss.get(px, py + 1) - gauss.get(px, py - 1);
            let mag = (gx * gx + gy * gy).sqrt();
            let ang = gy.atan2(gx).rem_euclid(std::f32::consts::TAU);
            let w = (-((dx * dx + dy * dy) as f32) / (2.0 * weight_sigma * weight_sigma)).exp();
            let bin = ((ang / std::f32::consts::TAU) * BINS as f32) as usize % BINS;
            hist[bin] += w * mag;
        }
    }

    // Two circular box-smoothing passes steady the peaks.
    for _ in 0..2 {
        let src = hist;
        for i in 0..BINS {
            hist[i] = (src[(i + BINS - 1) % BINS] + src[i] + src[(i + 1) % BINS]) / 3.0;
        }
    }

    let peak = hist.iter().cloned().fold(0.0f32, f32::max);
    if peak <= 0.0 {
        return vec![0.0];
    }

    let mut out = Vec::new();
    for i in 0..BINS {
        let l = hist[(i + BINS - 1) % BINS];
        let r = hist[(i + 1) % BINS];
        if hist[i] >= 0.8 * peak && hist[i] > l && hist[i] > r {
            // Parabolic refinement of the peak bin.
            let offset = 0.5 * (l - r) / (l - 2.0 * hist[i] + r);
            let ang = (i as f32 + 0.5 + offset) / BINS as f32 * std::f32::consts::TAU;
            out.push(ang.rem_euclid(std::f32::consts::TAU));
        }
    }
    if out.is_empty() {
        out.push(0.0);
    }
    out
}

/// 4x4 spatial cells x 8 orientation bins, sampled on a grid rotated to the
/// keypoint orientation, normalised, clamped at 0.2 and renormalised.
fn describe(gauss: &Field<f32>, kp: &KeyPoint) -> [f32; DESCRIPTOR_LEN] {
    const CELLS: usize = 4;
    const OBINS: usize = 8;
    let half = 8.0f32; // 16x16 sample window in octave pixels
    let octave_scale = (1usize << kp.octave) as f32;
    let cx = kp.x / octave_scale;
    let cy = kp.y / octave_scale;
    let (sin, cos) = kp.orientation.sin_cos();

    let mut desc = [0.0f32; DESCRIPTOR_LEN];
    let mut i = -half;
    while i < half {
        let mut j = -half;
        while j < half {
            // Rotate the sampling offset into image space.
            let sx = cx + j * cos - i * sin;
            let sy = cy + j * sin + i * cos;
            let px = sx.round() as i64;
            let py = sy.round() as i64;
            if px >= 1 && py >= 1 && px < gauss.width() as i64 - 1 && py < gauss.height() as i64 - 1
            {
                let (px, py) = (px as usize, py as usize);
                let gx = gauss.get(px + 1, py) - gauss.get(px - 1, py);
                let gy = gauss.get(px, py + 1) - gauss.get(px, py - 1);
                let mag = (gx * gx + gy * gy).sqrt();
                // Gradient angle relative to the keypoint orientation.
                let ang = (gy.atan2(gx) - kp.orientation).rem_euclid(std::f32::consts::TAU);
                let w = (-(i * i + j * j) / (2.0 * half * half)).exp();

                let cell_x = ((((j + half) / (2.0 * half)) * CELLS as f32) as usize).min(CELLS - 1);
                let cell_y = ((((i + half) / (2.0 * half)) * CELLS as f32) as usize).min(CELLS - 1);
                let bin = ((ang / std::f32::consts::TAU) * OBINS as f32) as usize % OBINS;
                desc[(cell_y * CELLS + cell_x) * OBINS + bin] += w * mag;
            }
            j += 1.0;
        }
        i += 1.0;
    }

    normalise_descriptor(&mut desc);
    desc
}

fn normalise_descriptor(desc: &mut [f32; DESCRIPTOR_LEN]) {
    let norm = desc.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm <= 1e-12 {
        return;
    }
    for v in desc.iter_mut() {
        *v = (*v / norm).min(0.2);
    }
    let norm = desc.iter().map(|v| v * v).sum::<f32>().sqrt();
    for v in desc.iter_mut() {
        *v /= norm;
    }
}

/// Gaussian blur with a kernel truncated at three sigma, edge clamped.
pub(crate) fn gaussian_blur(image: &Field<f32>, sigma: f32) -> Field<f32> {
    if sigma <= 0.0 {
        return image.clone();
    }
    let radius = (3.0 * sigma).ceil().max(1.0) as i64;
    let mut kernel = Vec::with_capacity((2 * radius + 1) as usize);
    let mut sum = 0.0f32;
    for i in -radius..=radius {
        let v = (-(i * i) as f32 / (2.0 * sigma * sigma)).exp();
        kernel.push(v);
        sum += v;
    }
    for v in &mut kernel {
        *v /= sum;
    }

    let horiz: Field<f32> = Field::from_fn(image.width(), image.height(), |x, y| {
        kernel
            .iter()
            .enumerate()
            .map(|(i, k)| k * image.get_clamped(x as i64 + i as i64 - radius, y as i64))
            .sum()
    });
    Field::from_fn(image.width(), image.height(), |x, y| {
        kernel
            .iter()
            .enumerate()
            .map(|(i, k)| k * horiz.get_clamped(x as i64, y as i64 + i as i64 - radius))
            .sum()
    })
}

pub(crate) fn downsample(image: &Field<f32>) -> Field<f32> {
    Field::from_fn(image.width() / 2, image.height() / 2, |x, y| {
        *image.get(x * 2, y * 2)
    })
}
