use argus_core::{Field, Progress};

use crate::{Error, Result};

/// One resolution level of the solver: a 5-point stencil per node
/// (centre, -x, +x, -y, +y), the right hand side, and the current solution.
struct Level {
    width: usize,
    height: usize,
    stencil: Field<[f32; 5]>,
    b: Field<f32>,
    x: Field<f32>,
}

impl Level {
    fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            stencil: Field::filled(width, height, [1.0, 0.0, 0.0, 0.0, 0.0]),
            b: Field::new(width, height),
            x: Field::new(width, height),
        }
    }
}

/// V-cycle multigrid for linear systems laid out on a 2D grid.
///
/// Each node carries one equation over itself and its 4 neighbours.
/// Smoothing is damped Jacobi; the residual is restricted by full weighting,
/// the correction prolonged bilinearly. Solves the kind of system the
/// integration stages of shape-from-shading produce, where a single-grid
/// relaxation would take forever to move low-frequency error.
pub struct Multigrid2d {
    levels: Vec<Level>,
    speed: f32,
    tolerance: f32,
    max_iters: usize,
    pre_sweeps: usize,
    post_sweeps: usize,
}

impl Multigrid2d {
    pub fn new(width: usize, height: usize) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidParameter(
                "multigrid needs a non-empty grid".into(),
            ));
        }
        let mut levels = vec![Level::new(width, height)];
        let (mut w, mut h) = (width, height);
        while w > 2 && h > 2 {
            w = w.div_ceil(2);
            h = h.div_ceil(2);
            levels.push(Level::new(w, h));
        }
        Ok(Self {
            levels,
            speed: 0.5,
            tolerance: 1e-3,
            max_iters: 1024,
            pre_sweeps: 2,
            post_sweeps: 2,
        })
    }

    /// Jacobi damping factor, default 0.5.
    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = speed;
        self
    }

    /// Residual max-norm at which iteration stops, default 1e-3.
    pub fn with_tolerance(mut self, tolerance: f32) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iters(mut self, max_iters: usize) -> Self {
        self.max_iters = max_iters;
        self
    }

    /// Sets the equation for one node of the finest grid:
    /// `centre*x[i] + w[0]*x[-x] + w[1]*x[+x] + w[2]*x[-y] + w[3]*x[+y] = b`.
    /// Neighbour weights over the grid edge are ignored during solving.
    pub fn set_equation(&mut self, x: usize, y: usize, centre: f32, neigh: [f32; 4], b: f32) {
        let lvl = &mut self.levels[0];
        lvl.stencil
            .set(x, y, [centre, neigh[0], neigh[1], neigh[2], neigh[3]]);
        lvl.b.set(x, y, b);
    }

    /// Initial guess for the solution; zero if never called.
    pub fn set_initial(&mut self, guess: &Field<f32>) -> Result<()> {
        if !guess.same_size(&self.levels[0].x) {
            return Err(Error::DimensionMismatch(
                "initial guess does not match the grid".into(),
            ));
        }
        self.levels[0].x = guess.clone();
        Ok(())
    }

    pub fn solution(&self) -> &Field<f32> {
        &self.levels[0].x
    }

    /// Runs V-cycles until the fine-grid residual max-norm is below the
    /// tolerance or the iteration cap hits. Returns the final residual norm.
    pub fn run(&mut self, prog: &mut Progress) -> Result<f32> {
        self.build_coarse_operators();

        prog.push();
        let mut residual = f32::INFINITY;
        for k in 0..self.max_iters {
            prog.report(k as u64, self.max_iters as u64);
            self.v_cycle(0);
            residual = self.residual_max_norm(0);
            if residual < self.tolerance {
                break;
            }
        }
        prog.pop();

        if residual.is_finite() {
            Ok(residual)
        } else {
            Err(Error::NumericalFailure("multigrid diverged".into()))
        }
    }

    /// Coarse stencils by summing each 2x2 patch of fine-node equations.
    fn build_coarse_operators(&mut self) {
        for l in 1..self.levels.len() {
            let (coarse_w, coarse_h) = (self.levels[l].width, self.levels[l].height);
            let mut stencil = Field::filled(coarse_w, coarse_h, [0.0f32; 5]);
            {
                let fine = &self.levels[l - 1];
                for cy in 0..coarse_h {
                    for cx in 0..coarse_w {
                        let mut acc = [0.0f32; 5];
                        let mut count = 0.0f32;
                        for sy in 0..2 {
                            for sx in 0..2 {
                                let fx = cx * 2 + sx;
                                let fy = cy * 2 + sy;
                                if fx < fine.width && fy < fine.height {
                                    let s = fine.stencil.get(fx, fy);
                                    for i in 0..5 {
                                        acc[i] += s[i];
                                    }
                                    count += 1.0;
                                }
                            }
                        }
                        if count > 0.0 {
                            for v in &mut acc {
                                *v /= count;
                            }
                        } else {
                            acc[0] = 1.0;
                        }
                        stencil.set(cx, cy, acc);
                    }
                }
            }
            self.levels[l].stencil = stencil;
        }
    }

    fn apply_at(lvl: &Level, x: usize, y: usize) -> f32 {
        let s = lvl.stencil.get(x, y);
        let mut v = s[0] * lvl.x.get(x, y);
        if x > 0 {
            v += s[1] * lvl.x.get(x - 1, y);
        }
        if x + 1 < lvl.width {
            v += s[2] * lvl.x.get(x + 1, y);
        }
        if y > 0 {
            v += s[3] * lvl.x.get(x, y - 1);
        }
        if y + 1 < lvl.height {
            v += s[4] * lvl.x.get(x, y + 1);
        }
        v
    }

    fn relax(&mut self, l: usize, sweeps: usize) {
        for _ in 0..sweeps {
            let lvl = &self.levels[l];
            let mut next = lvl.x.clone();
            for y in 0..lvl.height {
                for x in 0..lvl.width {
                    let s = lvl.stencil.get(x, y);
                    if s[0].abs() < 1e-12 {
                        continue;
                    }
                    let r = lvl.b.get(x, y) - Self::apply_at(lvl, x, y);
                    *next.get_mut(x, y) += self.speed * r / s[0];
                }
            }
            self.levels[l].x = next;
        }
    }

    fn residual_max_norm(&self, l: usize) -> f32 {
        let lvl = &self.levels[l];
        let mut worst = 0.0f32;
        for y in 0..lvl.height {
            for x in 0..lvl.width {
                let r = (lvl.b.get(x, y) - Self::apply_at(lvl, x, y)).abs();
                worst = worst.max(r);
            }
        }
        worst
    }

    fn v_cycle(&mut self, l: usize) {
        if l + 1 == self.levels.len() {
            // Coarsest grid is tiny: relax it into submission.
            self.relax(l, 32);
            return;
        }

        self.relax(l, self.pre_sweeps);

        // Restrict the residual to the coarse right hand side.
        {
            let (fine_levels, coarse_levels) = self.levels.split_at_mut(l + 1);
            let fine = &fine_levels[l];
            let coarse = &mut coarse_levels[0];
            for cy in 0..coarse.height {
                for cx in 0..coarse.width {
                    let mut acc = 0.0f32;
                    let mut weight = 0.0f32;
                    for sy in -1i64..=2 {
                        for sx in -1i64..=2 {
                            let fx = cx as i64 * 2 + sx;
                            let fy = cy as i64 * 2 + sy;
                            if fx < 0 || fy < 0 || fx >= fine.width as i64 || fy >= fine.height as i64
                            {
                                continue;
                            }
                            let w = if (0..=1).contains(&sx) && (0..=1).contains(&sy) {
                                1.0
                            } else {
                                0.25
                            };
                            let (fx, fy) = (fx as usize, fy as usize);
                            let r = fine.b.get(fx, fy) - Self::apply_at(fine, fx, fy);
                            acc += w * r;
                            weight += w;
                        }
                    }
                    coarse.b.set(cx, cy, if weight > 0.0 { acc / weight } else { 0.0 });
                    coarse.x.set(cx, cy, 0.0);
                }
            }
        }

        self.v_cycle(l + 1);

        // Prolong the coarse correction and add it in.
        {
            let (fine_levels, coarse_levels) = self.levels.split_at_mut(l + 1);
            let fine = &mut fine_levels[l];
            let coarse = &coarse_levels[0];
            for fy in 0..fine.height {
                for fx in 0..fine.width {
                    let gx = fx as f32 / 2.0;
                    let gy = fy as f32 / 2.0;
                    let x0 = gx.floor() as i64;
                    let y0 = gy.floor() as i64;
                    let tx = gx - x0 as f32;
                    let ty = gy - y0 as f32;
                    let c00 = *coarse.x.get_clamped(x0, y0);
                    let c10 = *coarse.x.get_clamped(x0 + 1, y0);
                    let c01 = *coarse.x.get_clamped(x0, y0 + 1);
                    let c11 = *coarse.x.get_clamped(x0 + 1, y0 + 1);
                    let corr = c00 * (1.0 - tx) * (1.0 - ty)
                        + c10 * tx * (1.0 - ty)
                        + c01 * (1.0 - tx) * ty
                        + c11 * tx * ty;
                    *fine.x.get_mut(fx, fy) += corr;
                }
            }
        }

        self.relax(l, self.post_sweeps);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Discrete Poisson problem with Dirichlet-style diagonal dominance:
    // (4 + eps) x - neighbours = b. The eps keeps the operator invertible
    // without boundary special cases.
    fn poisson_setup(mg: &mut Multigrid2d, w: usize, h: usize, rhs: impl Fn(usize, usize) -> f32) {
        for y in 0..h {
            for x in 0..w {
                mg.set_equation(x, y, 4.1, [-1.0, -1.0, -1.0, -1.0], rhs(x, y));
            }
        }
    }

    #[test]
    fn test_constant_solution() {
        // b chosen so x == 1 everywhere solves the interior exactly.
        let (w, h) = (33, 33);
        let mut mg = Multigrid2d::new(w, h).unwrap().with_tolerance(1e-4);
        for y in 0..h {
            for x in 0..w {
                let mut neighbours = 0.0;
                if x > 0 {
                    neighbours += 1.0;
                }
                if x + 1 < w {
                    neighbours += 1.0;
                }
                if y > 0 {
                    neighbours += 1.0;
                }
                if y + 1 < h {
                    neighbours += 1.0;
                }
                mg.set_equation(x, y, 4.1, [-1.0, -1.0, -1.0, -1.0], 4.1 - neighbours);
            }
        }
        let res = mg.run(&mut Progress::silent()).unwrap();
        assert!(res < 1e-4, "residual {}", res);
        for y in 0..h {
            for x in 0..w {
                assert!(
                    (mg.solution().get(x, y) - 1.0).abs() < 1e-2,
                    "x({},{}) = {}",
                    x,
                    y,
                    mg.solution().get(x, y)
                );
            }
        }
    }

    #[test]
    fn test_converges_on_point_source() {
        let mut mg = Multigrid2d::new(32, 32).unwrap().with_tolerance(1e-4);
        poisson_setup(&mut mg, 32, 32, |x, y| {
            if x == 16 && y == 16 {
                1.0
            } else {
                0.0
            }
        });
        let res = mg.run(&mut Progress::silent()).unwrap();
        assert!(res < 1e-4, "residual {}", res);
        // Peak at the source, decaying outwards.
        let peak = *mg.solution().get(16, 16);
        assert!(peak > 0.0);
        assert!(*mg.solution().get(2, 2) < peak);
    }

    #[test]
    fn test_empty_grid_rejected() {
        assert!(Multigrid2d::new(0, 5).is_err());
    }
}
