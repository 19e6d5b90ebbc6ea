use argus_core::{Field, Progress};
use nalgebra::{Unit, UnitQuaternion, Vector3};
use rayon::prelude::*;

use crate::{Error, Result};

/// Cone-constrained shape from shading.
///
/// Every pixel's irradiance fixes the angle between its normal and the
/// light direction, `cos(theta) = I / albedo`, which constrains the normal
/// to a cone around the light. Normals start on the cone nearest the image
/// gradient direction, then alternate between neighbourhood smoothing and
/// rotation back onto the cone until the field settles.
pub struct ShapeFromShading {
    pub light: Vector3<f32>,
    pub albedo: f32,
    pub iters: usize,
}

impl ShapeFromShading {
    pub fn new(light: Vector3<f32>) -> Self {
        Self {
            light,
            albedo: 1.0,
            iters: 200,
        }
    }

    pub fn with_albedo(mut self, albedo: f32) -> Self {
        self.albedo = albedo;
        self
    }

    pub fn with_iters(mut self, iters: usize) -> Self {
        self.iters = iters;
        self
    }

    /// Recovers a needle map from a grayscale image. Returns the normals
    /// and the mask of pixels that were actually solved; border pixels,
    /// black pixels and anything outside `mask` come back flat (0, 0, 1)
    /// and unsolved.
    pub fn run(
        &self,
        image: &Field<f32>,
        mask: Option<&Field<bool>>,
        prog: &mut Progress,
    ) -> Result<(Field<[f32; 3]>, Field<bool>)> {
        let width = image.width();
        let height = image.height();
        if width < 3 || height < 3 {
            return Err(Error::InvalidParameter(
                "image too small for shape from shading".into(),
            ));
        }
        if let Some(m) = mask {
            if !m.same_size(image) {
                return Err(Error::DimensionMismatch(
                    "mask and image differ in size".into(),
                ));
            }
        }
        if self.albedo <= 0.0 {
            return Err(Error::InvalidParameter("albedo must be positive".into()));
        }
        let light_norm = self.light.norm();
        if light_norm <= 0.0 {
            return Err(Error::InvalidParameter("zero light direction".into()));
        }
        let light = self.light / light_norm;

        prog.push();
        prog.report(0, (self.iters + 1) as u64);

        // The smoothing stencil needs a one-pixel border, so the border is
        // never solved. Black pixels have an undefined cone and are dropped
        // too.
        let solve = Field::from_fn(width, height, |x, y| {
            let interior = x > 0 && y > 0 && x < width - 1 && y < height - 1;
            let given = mask.map_or(true, |m| *m.get(x, y));
            interior && given && *image.get(x, y) > 0.0
        });

        let blurred = gaussian_blur(image);
        let mut needle = Field::from_fn(width, height, |x, y| {
            if !*solve.get(x, y) {
                return [0.0, 0.0, 1.0];
            }
            let theta = self.cone_angle(*image.get(x, y));

            // Initial on-cone normal: tilt the light direction towards the
            // image gradient, which points up the shading slope.
            let (dx, dy) = sobel(&blurred, x, y);
            let mut grad = Vector3::new(dx, dy, 0.0);
            if grad.norm() <= 1e-12 {
                grad = Vector3::new(-light.x, -light.y, 0.0);
                if grad.norm() <= 1e-12 {
                    grad = Vector3::new(1.0, 0.0, 0.0);
                }
            }
            let axis = grad.cross(&light);
            if axis.norm() <= 1e-12 {
                return to_array(&light);
            }
            let rot = UnitQuaternion::from_axis_angle(&Unit::new_normalize(axis), theta);
            to_array(&(rot * light))
        });

        let mut next = needle.clone();
        for iter in 1..=self.iters {
            prog.report(iter as u64, (self.iters + 1) as u64);

            // Smooth: average the four neighbours, renormalise.
            {
                let cur = &needle;
                let solve_ref = &solve;
                let mut rows: Vec<(usize, &mut [[f32; 3]])> =
                    next.rows_mut().enumerate().collect();
                rows.par_iter_mut().for_each(|(y, row)| {
                    let y = *y;
                    for x in 0..width {
                        if !*solve_ref.get(x, y) {
                            continue;
                        }
                        let mut sum = from_array(cur.get(x - 1, y))
                            + from_array(cur.get(x + 1, y))
                            + from_array(cur.get(x, y - 1))
                            + from_array(cur.get(x, y + 1));
                        if sum.norm() <= 1e-12 {
                            sum = from_array(cur.get(x, y));
                        }
                        row[x] = to_array(&sum.normalize());
                    }
                });
            }

            // Constrain: rotate each smoothed normal back onto its cone.
            {
                let solve_ref = &solve;
                let mut rows: Vec<(usize, &mut [[f32; 3]])> =
                    next.rows_mut().enumerate().collect();
                rows.par_iter_mut().for_each(|(y, row)| {
                    let y = *y;
                    for x in 0..width {
                        if !*solve_ref.get(x, y) {
                            continue;
                        }
                        let n = from_array(&row[x]);
                        let theta = self.cone_angle(*image.get(x, y));
                        row[x] = to_array(&rotate_onto_cone(&n, &light, theta));
                    }
                });
            }

            std::mem::swap(&mut needle, &mut next);
        }

        // Numerical error accumulates over many rotations.
        for n in needle.as_mut_slice() {
            let v = from_array(n);
            let len = v.norm();
            if len > 1e-12 {
                *n = to_array(&(v / len));
            }
        }

        prog.pop();
        tracing::debug!(iters = self.iters, "shape from shading done");
        Ok((needle, solve))
    }

    /// Cone half-angle for an image intensity. Over-bright pixels clamp to
    /// the apex, pointing straight at the light.
    fn cone_angle(&self, intensity: f32) -> f32 {
        let r = (intensity / self.albedo).min(1.0);
        let r = if r.is_finite() { r } else { 1.0 };
        r.acos()
    }
}

/// Rotates `n` about `n x light` so its angle to the light becomes exactly
/// `theta`, the closest point on the cone.
fn rotate_onto_cone(n: &Vector3<f32>, light: &Vector3<f32>, theta: f32) -> Vector3<f32> {
    let mut axis = n.cross(light);
    if axis.norm() <= 1e-12 {
        axis = Vector3::new(1.0, 0.0, 0.0);
    }
    let current = n.dot(light).clamp(-1.0, 1.0).acos();
    let rot = UnitQuaternion::from_axis_angle(&Unit::new_normalize(axis), current - theta);
    rot * n
}

#[inline]
fn to_array(v: &Vector3<f32>) -> [f32; 3] {
    [v.x, v.y, v.z]
}

#[inline]
fn from_array(a: &[f32; 3]) -> Vector3<f32> {
    Vector3::new(a[0], a[1], a[2])
}

/// Separable 5-tap Gaussian, edge-clamped. Used only to stabilise the
/// gradient estimate for initialisation.
fn gaussian_blur(image: &Field<f32>) -> Field<f32> {
    const K: [f32; 5] = [1.0 / 16.0, 4.0 / 16.0, 6.0 / 16.0, 4.0 / 16.0, 1.0 / 16.0];
    let horiz = Field::from_fn(image.width(), image.height(), |x, y| {
        let mut sum = 0.0;
        for (i, k) in K.iter().enumerate() {
            sum += k * image.get_clamped(x as i64 + i as i64 - 2, y as i64);
        }
        sum
    });
    Field::from_fn(image.width(), image.height(), |x, y| {
        let mut sum = 0.0;
        for (i, k) in K.iter().enumerate() {
            sum += k * horiz.get_clamped(x as i64, y as i64 + i as i64 - 2);
        }
        sum
    })
}

fn sobel(image: &Field<f32>, x: usize, y: usize) -> (f32, f32) {
    let (x, y) = (x as i64, y as i64);
    let g = |dx: i64, dy: i64| *image.get_clamped(x + dx, y + dy);
    let dx = (g(1, -1) + 2.0 * g(1, 0) + g(1, 1)) - (g(-1, -1) + 2.0 * g(-1, 0) + g(-1, 1));
    let dy = (g(-1, 1) + 2.0 * g(0, 1) + g(1, 1)) - (g(-1, -1) + 2.0 * g(0, -1) + g(1, -1));
    (dx, dy)
}
