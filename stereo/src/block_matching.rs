use argus_core::{Field, Progress};
use rayon::prelude::*;
use wide::f32x8;

use crate::{DisparityMap, Error, Result, StereoMatcher};

#[derive(Clone, Copy)]
pub enum MatchingMetric {
    /// Sum of absolute differences.
    Sad,
    /// Sum of squared differences.
    Ssd,
    /// Normalized cross-correlation (negated, so lower is better).
    Ncc,
}

/// Window-based stereo matcher.
///
/// For every pixel the window cost is evaluated across the disparity range
/// and the cheapest match wins, subject to a uniqueness test: if the
/// second-best cost is within `uniqueness_ratio` of the best, the match is
/// ambiguous and the pixel is marked invalid.
pub struct BlockMatcher {
    pub block_size: usize,
    pub min_disparity: i32,
    pub max_disparity: i32,
    pub metric: MatchingMetric,
    pub uniqueness_ratio: f32,
}

impl Default for BlockMatcher {
    fn default() -> Self {
        Self {
            block_size: 9,
            min_disparity: -30,
            max_disparity: 30,
            metric: MatchingMetric::Sad,
            uniqueness_ratio: 0.95,
        }
    }
}

impl BlockMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn with_disparity_range(mut self, min: i32, max: i32) -> Self {
        self.min_disparity = min;
        self.max_disparity = max;
        self
    }

    pub fn with_metric(mut self, metric: MatchingMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_uniqueness_ratio(mut self, ratio: f32) -> Self {
        self.uniqueness_ratio = ratio;
        self
    }
}

impl StereoMatcher for BlockMatcher {
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
        if self.block_size % 2 == 0 || self.block_size == 0 {
            return Err(Error::InvalidParameter(
                "block size must be odd and non-zero".into(),
            ));
        }
        if self.min_disparity > self.max_disparity {
            return Err(Error::InvalidParameter(
                "empty disparity range".into(),
            ));
        }

        let width = left.width();
        let height = left.height();
        let half = (self.block_size / 2) as i64;
        let mut out = DisparityMap::new(width, height, self.min_disparity, self.max_disparity);

        prog.report(0, 1);
        let valid_rows: Vec<Vec<bool>> = {
            let disp_rows: Vec<(usize, &mut [f32])> = out
                .disp
                .rows_mut()
                .enumerate()
                .collect();

            disp_rows
                .into_par_iter()
                .map(|(y, disp_row)| {
                    let mut valid_row = vec![false; width];
                    let y = y as i64;
                    if y < half || y >= height as i64 - half {
                        return valid_row;
                    }
                    for x in half..width as i64 - half {
                        if let Some(d) = self.match_pixel(left, right, x, y, half) {
                            disp_row[x as usize] = d as f32;
                            valid_row[x as usize] = true;
                        }
                    }
                    valid_row
                })
                .collect()
        };
        for (y, row) in valid_rows.into_iter().enumerate() {
            for (x, v) in row.into_iter().enumerate() {
                out.valid.set(x, y, v);
            }
        }
        prog.report(1, 1);

        tracing::debug!(valid = out.valid_count(), total = width * height, "block match done");
        Ok(out)
    }
}

impl BlockMatcher {
    /// Best disparity for one pixel, or `None` when no disparity fits the
    /// image bounds or the winner fails the uniqueness test.
    fn match_pixel(
        &self,
        left: &Field<f32>,
        right: &Field<f32>,
        x: i64,
        y: i64,
        half: i64,
    ) -> Option<i32> {
        let width = left.width() as i64;

        // Keep every right-image window access in bounds:
        // x - d - half >= 0 and x - d + half <= width - 1.
        let d_lo = (x + half - (width - 1)).max(self.min_disparity as i64);
        let d_hi = (x - half).min(self.max_disparity as i64);
        if d_lo > d_hi {
            return None;
        }

        let mut best = d_lo;
        let mut best_cost = f32::INFINITY;
        let mut second = f32::INFINITY;
        for d in d_lo..=d_hi {
            let cost = match self.metric {
                MatchingMetric::Sad => window_sad(left, right, x, y, d, half),
                MatchingMetric::Ssd => window_ssd(left, right, x, y, d, half),
                MatchingMetric::Ncc => -window_ncc(left, right, x, y, d, half),
            };
            if cost < best_cost {
                second = best_cost;
                best_cost = cost;
                best = d;
            } else if cost < second {
                second = cost;
            }
        }

        // Ambiguous when the runner-up is within the uniqueness margin of
        // the winner. A lone candidate has no competition to lose to.
        if second.is_finite() && best_cost > second * self.uniqueness_ratio - 1e-6 {
            None
        } else {
            Some(best as i32)
        }
    }
}

#[inline]
fn window_rows<'a>(
    left: &'a Field<f32>,
    right: &'a Field<f32>,
    x: i64,
    y: i64,
    d: i64,
    dy: i64,
    half: i64,
) -> (&'a [f32], &'a [f32]) {
    let ly = (y + dy) as usize;
    let l0 = (x - half) as usize;
    let r0 = (x - d - half) as usize;
    let n = (2 * half + 1) as usize;
    (
        &left.row(ly)[l0..l0 + n],
        &right.row(ly)[r0..r0 + n],
    )
}

#[inline]
fn load8(s: &[f32], i: usize) -> f32x8 {
    f32x8::from([
        s[i],
        s[i + 1],
        s[i + 2],
        s[i + 3],
        s[i + 4],
        s[i + 5],
        s[i + 6],
        s[i + 7],
    ])
}

fn window_sad(left: &Field<f32>, right: &Field<f32>, x: i64, y: i64, d: i64, half: i64) -> f32 {
    let mut acc = f32x8::ZERO;
    let mut tail = 0.0f32;
    for dy in -half..=half {
        let (l, r) = window_rows(left, right, x, y, d, dy, half);
        let mut i = 0;
        while i + 8 <= l.len() {
            let lv = load8(l, i);
            let rv = load8(r, i);
            acc += (lv - rv).abs();
            i += 8;
        }
        for j in i..l.len() {
            tail += (l[j] - r[j]).abs();
        }
    }
    acc.reduce_add() + tail
}

fn window_ssd(left: &Field<f32>, right: &Field<f32>, x: i64, y: i64, d: i64, half: i64) -> f32 {
    let mut acc = f32x8::ZERO;
    let mut tail = 0.0f32;
    for dy in -half..=half {
        let (l, r) = window_rows(left, right, x, y, d, dy, half);
        let mut i = 0;
        while i + 8 <= l.len() {
            let lv = load8(l, i);
            let rv = load8(r, i);
            let diff = lv - rv;
            acc += diff * diff;
            i += 8;
        }
        for j in i..l.len() {
            let diff = l[j] - r[j];
            tail += diff * diff;
        }
    }
    acc.reduce_add() + tail
}

fn window_ncc(left: &Field<f32>, right: &Field<f32>, x: i64, y: i64, d: i64, half: i64) -> f32 {
    let mut sum_l = 0.0f64;
    let mut sum_r = 0.0f64;
    let mut sum_ll = 0.0f64;
    let mut sum_rr = 0.0f64;
    let mut sum_lr = 0.0f64;
    let mut n = 0.0f64;
    for dy in -half..=half {
        let (l, r) = window_rows(left, right, x, y, d, dy, half);
        for (lv, rv) in l.iter().zip(r) {
            let (lv, rv) = (*lv as f64, *rv as f64);
            sum_l += lv;
            sum_r += rv;
            sum_ll += lv * lv;
            sum_rr += rv * rv;
            sum_lr += lv * rv;
            n += 1.0;
        }
    }
    let cov = sum_lr - sum_l * sum_r / n;
    let var_l = sum_ll - sum_l * sum_l / n;
    let var_r = sum_rr - sum_r * sum_r / n;
    let denom = (var_l * var_r).sqrt();
    if denom < 1e-12 {
        0.0
    } else {
        (cov / denom) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Pair where the left pixel x matches right pixel x - d, i.e. the
    // returned disparity should equal `d` everywhere.
    fn shifted_pair(width: usize, height: usize, d: i64) -> (Field<f32>, Field<f32>) {
        // Random-ish texture so windows are discriminative.
        let tex = |x: i64, y: i64| {
            let v = (x * 37 + y * 91) % 255;
            (v as f32 / 255.0 * 0.8) + ((x * x + 3 * y) % 13) as f32 * 0.01
        };
        let left = Field::from_fn(width, height, |x, y| tex(x as i64, y as i64));
        let right = Field::from_fn(width, height, |x, y| tex(x as i64 + d, y as i64));
        (left, right)
    }

    #[test]
    fn test_recovers_uniform_shift() {
        // right is left shifted by +6, so disparity left->right is 6.
        let (left, right) = shifted_pair(64, 32, 6);
        let matcher = BlockMatcher::new()
            .with_block_size(7)
            .with_disparity_range(0, 12);
        let dm = matcher
            .compute(&left, &right, &mut Progress::silent())
            .unwrap();

        let mut hits = 0;
        let mut total = 0;
        for y in 4..28 {
            for x in 16..56 {
                if *dm.valid.get(x, y) {
                    total += 1;
                    if (*dm.disp.get(x, y) - 6.0).abs() < 0.5 {
                        hits += 1;
                    }
                }
            }
        }
        assert!(total > 100, "too few valid pixels: {}", total);
        assert!(hits as f32 / total as f32 > 0.9);
    }

    #[test]
    fn test_negative_disparity_range() {
        let (left, right) = shifted_pair(64, 24, -5);
        let matcher = BlockMatcher::new()
            .with_block_size(7)
            .with_disparity_range(-10, 0);
        let dm = matcher
            .compute(&left, &right, &mut Progress::silent())
            .unwrap();
        let mut hits = 0;
        let mut total = 0;
        for y in 4..20 {
            for x in 16..48 {
                if *dm.valid.get(x, y) {
                    total += 1;
                    if (*dm.disp.get(x, y) + 5.0).abs() < 0.5 {
                        hits += 1;
                    }
                }
            }
        }
        assert!(total > 50);
        assert!(hits as f32 / total as f32 > 0.9);
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let l = Field::<f32>::new(10, 10);
        let r = Field::<f32>::new(11, 10);
        assert!(BlockMatcher::new()
            .compute(&l, &r, &mut Progress::silent())
            .is_err());
    }

    #[test]
    fn test_even_block_size_rejected() {
        let l = Field::<f32>::new(10, 10);
        assert!(BlockMatcher::new()
            .with_block_size(8)
            .compute(&l, &l, &mut Progress::silent())
            .is_err());
    }
}
