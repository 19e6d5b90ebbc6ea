use argus_core::{Field, Progress};

use crate::{Error, Result};

/// Per-pixel diffusion weights for the four axis directions, derived from
/// intensity similarity: weight falls off as the negative exponential of the
/// neighbour distance, offset by the smallest distance for stability, and is
/// normalised so each pixel's outgoing weights sum to one. Directions that
/// leave the image get zero.
pub struct DiffusionWeight {
    data: Field<[f32; 4]>,
}

/// Direction coding shared with [`DiffusionSlice`]: +x, +y, -x, -y.
const DX: [i64; 4] = [1, 0, -1, 0];
const DY: [i64; 4] = [0, 1, 0, -1];

impl DiffusionWeight {
    pub fn new(img: &Field<f32>, dist_mult: f32) -> Self {
        let data = Field::from_fn(img.width(), img.height(), |x, y| {
            let mut dist = [f32::INFINITY; 4];
            let centre = *img.get(x, y);
            for d in 0..4 {
                let nx = x as i64 + DX[d];
                let ny = y as i64 + DY[d];
                if img.in_bounds(nx, ny) {
                    dist[d] = (centre - img.get(nx as usize, ny as usize)).abs();
                }
            }

            let low = dist.iter().cloned().fold(f32::INFINITY, f32::min);
            let mut weight = [0.0f32; 4];
            let mut sum = 0.0f32;
            for d in 0..4 {
                if dist[d].is_finite() {
                    weight[d] = (-dist_mult * (dist[d] - low)).exp();
                    sum += weight[d];
                }
            }
            if sum > 0.0 {
                for w in &mut weight {
                    *w /= sum;
                }
            }
            weight
        });
        Self { data }
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize, dir: usize) -> f32 {
        self.data.get(x, y)[dir]
    }
}

/// Diffusion weights for one scanline: for every x, the mass a unit impulse
/// spreads over the diamond `|u| + |v| <= steps` after walking `steps`
/// diffusion steps through [`DiffusionWeight`]. Weights off the image are
/// zero and each pixel's diamond is renormalised to sum to one.
pub struct DiffusionSlice {
    y: usize,
    steps: usize,
    width: usize,
    // Per x, the diamond linearised via `offset`.
    data: Vec<Vec<f32>>,
    // (u + steps) + (v + steps) * (2 steps + 1) -> diamond index.
    offset: Vec<usize>,
    diamond: usize,
}

impl DiffusionSlice {
    pub fn new(img: &Field<f32>, dw: &DiffusionWeight, y: usize, steps: usize) -> Self {
        let side = 2 * steps + 1;
        let mut offset = vec![usize::MAX; side * side];
        let mut diamond = 0;
        for v in 0..side {
            for u in 0..side {
                let (ru, rv) = (u as i64 - steps as i64, v as i64 - steps as i64);
                if ru.abs() + rv.abs() <= steps as i64 {
                    offset[v * side + u] = diamond;
                    diamond += 1;
                }
            }
        }

        let width = img.width();
        let mut data = Vec::with_capacity(width);
        let mut from = vec![0.0f32; side * side];
        let mut to = vec![0.0f32; side * side];
        for x in 0..width {
            from.iter_mut().for_each(|v| *v = 0.0);
            from[steps * side + steps] = 1.0;

            for s in 0..steps {
                to.iter_mut().for_each(|v| *v = 0.0);
                for v in -(s as i64)..=s as i64 {
                    for u in -(s as i64)..=s as i64 {
                        if u.abs() + v.abs() > s as i64 {
                            continue;
                        }
                        let ax = x as i64 + u;
                        let ay = y as i64 + v;
                        if !img.in_bounds(ax, ay) {
                            continue;
                        }
                        let idx = (v + steps as i64) as usize * side + (u + steps as i64) as usize;
                        let val = from[idx];
                        if val == 0.0 {
                            continue;
                        }
                        for d in 0..4 {
                            let nidx = (v + DY[d] + steps as i64) as usize * side
                                + (u + DX[d] + steps as i64) as usize;
                            to[nidx] += val * dw.get(ax as usize, ay as usize, d);
                        }
                    }
                }
                std::mem::swap(&mut from, &mut to);
            }

            let mut mask = vec![0.0f32; diamond];
            for v in 0..side {
                for u in 0..side {
                    let o = offset[v * side + u];
                    if o != usize::MAX {
                        mask[o] = from[v * side + u];
                    }
                }
            }
            // Renormalise; the sum drifts below one where mass walked off
            // the image.
            let sum: f32 = mask.iter().sum();
            if sum > 0.0 {
                for m in &mut mask {
                    *m /= sum;
                }
            }
            data.push(mask);
        }

        Self {
            y,
            steps,
            width,
            data,
            offset,
            diamond,
        }
    }

    pub fn y(&self) -> usize {
        self.y
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Weight of window offset (u, v) for pixel x; zero outside the diamond.
    pub fn get(&self, x: usize, u: i64, v: i64) -> f32 {
        if u.abs() + v.abs() > self.steps as i64 {
            return 0.0;
        }
        let side = 2 * self.steps + 1;
        let idx = (v + self.steps as i64) as usize * side + (u + self.steps as i64) as usize;
        self.data[x][self.offset[idx]]
    }

    pub fn diamond_len(&self) -> usize {
        self.diamond
    }
}

/// Correlation cost between scanline positions of two images, weighting each
/// window pixel by the diffusion masks of both sides and capping the
/// per-pixel distance so outliers and occlusions saturate instead of
/// dominating. Off-image pixels pay the cap.
pub struct DiffuseCorrelation<'a> {
    left: &'a Field<f32>,
    right: &'a Field<f32>,
    left_slice: DiffusionSlice,
    right_slice: DiffusionSlice,
    dist_cap: f32,
}

impl<'a> DiffuseCorrelation<'a> {
    /// Builds the diffusion weights and slices for scanline `y` of both
    /// images. `steps` bounds the window to `|u| + |v| <= steps`.
    pub fn new(
        left: &'a Field<f32>,
        right: &'a Field<f32>,
        y: usize,
        steps: usize,
        dist_mult: f32,
        dist_cap: f32,
        prog: &mut Progress,
    ) -> Result<Self> {
        if !left.same_size(right) {
            return Err(Error::DimensionMismatch(
                "left and right images differ in size".into(),
            ));
        }
        if y >= left.height() {
            return Err(Error::InvalidParameter(format!(
                "scanline {} out of range {}",
                y,
                left.height()
            )));
        }
        if dist_cap <= 0.0 {
            return Err(Error::InvalidParameter(
                "distance cap must be positive".into(),
            ));
        }

        prog.push();
        prog.report(0, 4);
        let left_dw = DiffusionWeight::new(left, dist_mult);
        prog.report(1, 4);
        let right_dw = DiffusionWeight::new(right, dist_mult);
        prog.report(2, 4);
        let left_slice = DiffusionSlice::new(left, &left_dw, y, steps);
        prog.report(3, 4);
        let right_slice = DiffusionSlice::new(right, &right_dw, y, steps);
        prog.pop();

        Ok(Self {
            left,
            right,
            left_slice,
            right_slice,
            dist_cap,
        })
    }

    pub fn dist_cap(&self) -> f32 {
        self.dist_cap
    }

    /// Cost of matching left column `x1` against right column `x2` on the
    /// slice's scanline. Lower is better; the result lies in [0, cap].
    pub fn cost(&self, x1: usize, x2: usize) -> f32 {
        let steps = self.left_slice.steps() as i64;
        let y = self.left_slice.y() as i64;
        let mut ret = 0.0f32;
        for v in -steps..=steps {
            for u in -(steps - v.abs())..=(steps - v.abs()) {
                let weight = self.left_slice.get(x1, u, v) + self.right_slice.get(x2, u, v);
                if weight == 0.0 {
                    continue;
                }
                let lx = x1 as i64 + u;
                let rx = x2 as i64 + u;
                let yy = y + v;
                let d = if self.left.in_bounds(lx, yy) && self.right.in_bounds(rx, yy) {
                    (self.left.get(lx as usize, yy as usize)
                        - self.right.get(rx as usize, yy as usize))
                    .abs()
                    .min(self.dist_cap)
                } else {
                    self.dist_cap
                };
                ret += weight * d;
            }
        }
        ret / 2.0
    }
}
