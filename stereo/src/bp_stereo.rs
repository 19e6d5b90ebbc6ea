use argus_core::{Field, Progress};
use argus_optimize::{bp2d, Bp2dParams};

use crate::{DisparityMap, Error, Result, StereoMatcher};

/// Global stereo matcher: truncated-linear data costs fed to hierarchical
/// belief propagation.
///
/// Where [`crate::BlockMatcher`] picks each pixel's disparity independently,
/// this one trades data fidelity against neighbour agreement over the whole
/// grid, which fills weakly textured regions at the price of runtime.
pub struct BpStereo {
    pub min_disparity: i32,
    pub max_disparity: i32,
    /// Truncation for the per-pixel intensity difference cost.
    pub data_cap: f32,
    pub smooth_rate: f32,
    pub smooth_cap: f32,
    pub levels: usize,
    pub iters: usize,
}

impl Default for BpStereo {
    fn default() -> Self {
        Self {
            min_disparity: -30,
            max_disparity: 30,
            data_cap: 0.3,
            smooth_rate: 0.1,
            smooth_cap: 0.6,
            levels: 5,
            iters: 10,
        }
    }
}

impl BpStereo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_disparity_range(mut self, min: i32, max: i32) -> Self {
        self.min_disparity = min;
        self.max_disparity = max;
        self
    }

    pub fn with_schedule(mut self, levels: usize, iters: usize) -> Self {
        self.levels = levels;
        self.iters = iters;
        self
    }
}

impl StereoMatcher for BpStereo {
    fn compute(
        &self,
        left: &Field<f32>,
        right: &Field<f32>,
        prog: &mut Progress,
    ) -> Result<DisparityMap> {
        if !left.same_size(right) {
            return Err(Error::DimensionMismatch(
                "left and right images differ in size".into(),
            ));
        }
        if self.min_disparity > self.max_disparity {
            return Err(Error::InvalidParameter("empty disparity range".into()));
        }

        let width = left.width();
        let height = left.height();
        let labels = (self.max_disparity - self.min_disparity + 1) as usize;
        let min_d = self.min_disparity;
        let cap = self.data_cap;

        let params = Bp2dParams {
            labels,
            smooth_rate: self.smooth_rate,
            smooth_cap: self.smooth_cap,
            levels: self.levels,
            iters: self.iters,
        };

        // Off-image candidates cost the cap, so they neither win outright
        // nor forbid the smoothness term from choosing them at occlusions.
        let cost = |x: usize, y: usize, label: usize| -> f32 {
            let d = min_d + label as i32;
            let rx = x as i64 - d as i64;
            if rx < 0 || rx >= width as i64 {
                return cap;
            }
            (left.get(x, y) - right.get(rx as usize, y)).abs().min(cap)
        };

        let labels_field = bp2d(width, height, &params, &cost, prog)?;

        let mut out = DisparityMap::new(width, height, self.min_disparity, self.max_disparity);
        for y in 0..height {
            for x in 0..width {
                let d = min_d + *labels_field.get(x, y) as i32;
                out.disp.set(x, y, d as f32);
                let rx = x as i64 - d as i64;
                out.valid.set(x, y, rx >= 0 && rx < width as i64);
            }
        }
        Ok(out)
    }
}
