use argus_core::Field;
use nalgebra::{Matrix3, Vector3};

use crate::{DisparityMap, Error, Result};

/// Plane fitted to the disparities of one segment, `d = a*x + b*y + c`.
#[derive(Debug, Clone)]
pub struct SegmentPlane {
    pub plane: [f32; 3],
    pub centroid: (f32, f32),
    /// Pixel count of the segment, valid or not.
    pub area: usize,
    /// False when too few valid disparities survived fitting.
    pub fitted: bool,
}

impl SegmentPlane {
    pub fn eval(&self, x: f32, y: f32) -> f32 {
        self.plane[0] * x + self.plane[1] * y + self.plane[2]
    }
}

/// Fits a disparity plane to every segment of an over-segmentation, then
/// optionally replaces per-pixel disparities with the plane values.
///
/// Fitting is least squares with outlier rejection: after each pass, pixels
/// whose residual exceeds `outlier_threshold` are dropped and the plane is
/// refitted, which keeps a segment straddling a depth edge from averaging
/// the two surfaces.
pub struct PlaneFitter {
    pub outlier_threshold: f32,
    pub refit_passes: usize,
    pub min_samples: usize,
}

impl Default for PlaneFitter {
    fn default() -> Self {
        Self {
            outlier_threshold: 1.0,
            refit_passes: 2,
            min_samples: 3,
        }
    }
}

impl PlaneFitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outlier_threshold(mut self, threshold: f32) -> Self {
        self.outlier_threshold = threshold;
        self
    }

    pub fn with_refit_passes(mut self, passes: usize) -> Self {
        self.refit_passes = passes;
        self
    }

    /// Fits a plane per segment. `segments` assigns each pixel an id below
    /// `segment_count`; only pixels valid in `dm` contribute samples.
    pub fn fit(
        &self,
        segments: &Field<u32>,
        segment_count: usize,
        dm: &DisparityMap,
    ) -> Result<Vec<SegmentPlane>> {
        if !segments.same_size(&dm.disp) {
            return Err(Error::DimensionMismatch(
                "segment map and disparity map differ in size".into(),
            ));
        }

        // Gather samples per segment in one sweep.
        let mut samples: Vec<Vec<(f32, f32, f32)>> = vec![Vec::new(); segment_count];
        let mut areas = vec![0usize; segment_count];
        let mut sums = vec![(0.0f64, 0.0f64); segment_count];
        for y in 0..segments.height() {
            for x in 0..segments.width() {
                let s = *segments.get(x, y) as usize;
                if s >= segment_count {
                    return Err(Error::InvalidParameter(format!(
                        "segment id {} out of range {}",
                        s, segment_count
                    )));
                }
                areas[s] += 1;
                sums[s].0 += x as f64;
                sums[s].1 += y as f64;
                if *dm.valid.get(x, y) {
                    samples[s].push((x as f32, y as f32, *dm.disp.get(x, y)));
                }
            }
        }

        let mut out = Vec::with_capacity(segment_count);
        for s in 0..segment_count {
            let centroid = if areas[s] > 0 {
                (
                    (sums[s].0 / areas[s] as f64) as f32,
                    (sums[s].1 / areas[s] as f64) as f32,
                )
            } else {
                (0.0, 0.0)
            };
            out.push(self.fit_one(&mut samples[s], centroid, areas[s]));
        }
        Ok(out)
    }

    fn fit_one(
        &self,
        samples: &mut Vec<(f32, f32, f32)>,
        centroid: (f32, f32),
        area: usize,
    ) -> SegmentPlane {
        let mut plane = None;
        for pass in 0..=self.refit_passes {
            if samples.len() < self.min_samples {
                plane = None;
                break;
            }
            let p = match fit_plane(samples) {
                Some(p) => p,
                None => break,
            };
            if pass < self.refit_passes {
                let before = samples.len();
                samples.retain(|&(x, y, d)| {
                    (p[0] * x + p[1] * y + p[2] - d).abs() <= self.outlier_threshold
                });
                plane = Some(p);
                if samples.len() == before {
                    break;
                }
            } else {
                plane = Some(p);
            }
        }

        match plane {
            Some(p) => SegmentPlane {
                plane: p,
                centroid,
                area,
                fitted: true,
            },
            None => SegmentPlane {
                plane: [0.0; 3],
                centroid,
                area,
                fitted: false,
            },
        }
    }

    /// Rewrites the disparity map so every pixel of a fitted segment takes
    /// its plane value and becomes valid. Pixels of unfitted segments keep
    /// their original disparity and validity.
    pub fn extract(
        &self,
        segments: &Field<u32>,
        planes: &[SegmentPlane],
        dm: &mut DisparityMap,
    ) -> Result<()> {
        if !segments.same_size(&dm.disp) {
            return Err(Error::DimensionMismatch(
                "segment map and disparity map differ in size".into(),
            ));
        }
        for y in 0..segments.height() {
            for x in 0..segments.width() {
                let s = *segments.get(x, y) as usize;
                let plane = planes.get(s).ok_or_else(|| {
                    Error::InvalidParameter(format!("segment id {} has no plane", s))
                })?;
                if plane.fitted {
                    dm.disp.set(x, y, plane.eval(x as f32, y as f32));
                    dm.valid.set(x, y, true);
                }
            }
        }
        Ok(())
    }
}

/// Least-squares plane through `(x, y) -> d` samples via the 3x3 normal
/// equations. Coordinates are shifted to their mean first so the system
/// stays well conditioned far from the origin.
fn fit_plane(samples: &[(f32, f32, f32)]) -> Option<[f32; 3]> {
    let n = samples.len() as f64;
    let mx = samples.iter().map(|s| s.0 as f64).sum::<f64>() / n;
    let my = samples.iter().map(|s| s.1 as f64).sum::<f64>() / n;

    let mut ata = Matrix3::<f64>::zeros();
    let mut atb = Vector3::<f64>::zeros();
    for &(x, y, d) in samples {
        let row = Vector3::new(x as f64 - mx, y as f64 - my, 1.0);
        ata += row * row.transpose();
        atb += row * d as f64;
    }

    let sol = ata.lu().solve(&atb)?;
    let (a, b) = (sol[0], sol[1]);
    // Undo the centring shift: d = a(x-mx) + b(y-my) + c'.
    let c = sol[2] - a * mx - b * my;
    Some([a as f32, b as f32, c as f32])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_plane_scene() -> (Field<u32>, DisparityMap) {
        // Left half: d = 0.1x + 2; right half: d = -0.05y + 8.
        let (w, h) = (20usize, 10usize);
        let segments = Field::from_fn(w, h, |x, _| if x < 10 { 0u32 } else { 1 });
        let mut dm = DisparityMap::new(w, h, 0, 16);
        for y in 0..h {
            for x in 0..w {
                let d = if x < 10 {
                    0.1 * x as f32 + 2.0
                } else {
                    -0.05 * y as f32 + 8.0
                };
                dm.disp.set(x, y, d);
                dm.valid.set(x, y, true);
            }
        }
        (segments, dm)
    }

    #[test]
    fn test_fits_two_planes() {
        let (segments, dm) = two_plane_scene();
        let planes = PlaneFitter::new().fit(&segments, 2, &dm).unwrap();
        assert_eq!(planes.len(), 2);
        assert!(planes[0].fitted && planes[1].fitted);
        assert!((planes[0].plane[0] - 0.1).abs() < 1e-4);
        assert!((planes[0].plane[2] - 2.0).abs() < 1e-3);
        assert!((planes[1].plane[1] + 0.05).abs() < 1e-4);
        assert_eq!(planes[0].area, 100);
        assert!((planes[0].centroid.0 - 4.5).abs() < 1e-4);
    }

    #[test]
    fn test_outliers_rejected() {
        let (segments, mut dm) = two_plane_scene();
        // Corrupt a handful of pixels in segment 0 badly.
        for x in 0..5 {
            dm.disp.set(x, 0, 40.0);
        }
        let planes = PlaneFitter::new()
            .with_outlier_threshold(0.5)
            .with_refit_passes(3)
            .fit(&segments, 2, &dm)
            .unwrap();
        assert!((planes[0].plane[0] - 0.1).abs() < 1e-3);
        assert!((planes[0].plane[2] - 2.0).abs() < 1e-2);
    }

    #[test]
    fn test_extract_fills_invalid_pixels() {
        let (segments, mut dm) = two_plane_scene();
        dm.valid.set(3, 3, false);
        dm.disp.set(3, 3, 0.0);
        let fitter = PlaneFitter::new();
        let planes = fitter.fit(&segments, 2, &dm).unwrap();
        fitter.extract(&segments, &planes, &mut dm).unwrap();
        assert!(*dm.valid.get(3, 3));
        assert!((*dm.disp.get(3, 3) - (0.1 * 3.0 + 2.0)).abs() < 1e-3);
    }

    #[test]
    fn test_tiny_segment_not_fitted() {
        let segments = Field::from_fn(4, 1, |x, _| if x == 0 { 0u32 } else { 1 });
        let mut dm = DisparityMap::new(4, 1, 0, 4);
        for x in 0..4 {
            dm.disp.set(x, 0, 1.0);
            dm.valid.set(x, 0, true);
        }
        let planes = PlaneFitter::new().fit(&segments, 2, &dm).unwrap();
        assert!(!planes[0].fitted);
    }
}
