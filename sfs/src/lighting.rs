use argus_core::Field;
use nalgebra::{Matrix4, Vector3, Vector4};

use crate::{Error, Result};

/// Estimated scene lighting: an unnormalised light vector whose magnitude
/// absorbs albedo and source strength, plus a constant ambient term.
#[derive(Debug, Clone, Copy)]
pub struct Lighting {
    pub light: Vector3<f32>,
    pub ambient: f32,
}

impl Lighting {
    /// Light direction as a unit vector.
    pub fn direction(&self) -> Vector3<f32> {
        self.light.normalize()
    }

    /// Combined albedo * intensity factor.
    pub fn strength(&self) -> f32 {
        self.light.norm()
    }
}

/// Linear least squares for `n . l + a = I` over the pixels where `mask`
/// is true (all pixels when absent). Pixels in shadow violate the linear
/// model, so callers should mask them out. Needs at least 4 samples for
/// the 4 unknowns.
pub fn estimate_lighting(
    normals: &Field<[f32; 3]>,
    image: &Field<f32>,
    mask: Option<&Field<bool>>,
) -> Result<Lighting> {
    if !normals.same_size(image) {
        return Err(Error::DimensionMismatch(
            "needle map and image differ in size".into(),
        ));
    }
    if let Some(m) = mask {
        if !m.same_size(image) {
            return Err(Error::DimensionMismatch(
                "mask and image differ in size".into(),
            ));
        }
    }

    let mut ata = Matrix4::<f64>::zeros();
    let mut atb = Vector4::<f64>::zeros();
    let mut count = 0usize;
    for y in 0..image.height() {
        for x in 0..image.width() {
            if let Some(m) = mask {
                if !m.get(x, y) {
                    continue;
                }
            }
            let n = normals.get(x, y);
            let row = Vector4::new(n[0] as f64, n[1] as f64, n[2] as f64, 1.0);
            ata += row * row.transpose();
            atb += row * *image.get(x, y) as f64;
            count += 1;
        }
    }

    if count < 4 {
        return Err(Error::InvalidParameter(format!(
            "lighting estimation needs at least 4 samples, got {}",
            count
        )));
    }

    let sol = ata
        .lu()
        .solve(&atb)
        .ok_or_else(|| Error::NumericalFailure("degenerate normal distribution".into()))?;

    Ok(Lighting {
        light: Vector3::new(sol[0] as f32, sol[1] as f32, sol[2] as f32),
        ambient: sol[3] as f32,
    })
}
