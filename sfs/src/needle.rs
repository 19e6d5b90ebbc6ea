use argus_core::Field;
use nalgebra::Vector3;

/// Renders a needle map under the Lambertian model:
/// `I = ambient + albedo * max(0, n . l)`. Zero normals shade to the
/// ambient term alone, so masked-out pixels stay flat.
pub fn render_needle_map(
    normals: &Field<[f32; 3]>,
    light: &Vector3<f32>,
    albedo: f32,
    ambient: f32,
) -> Field<f32> {
    Field::from_fn(normals.width(), normals.height(), |x, y| {
        let n = normals.get(x, y);
        let dot = n[0] * light.x + n[1] * light.y + n[2] * light.z;
        ambient + albedo * dot.max(0.0)
    })
}

/// Packs a needle map into displayable RGB: x and y map to [0, 1] around
/// 0.5, z to the blue channel. Normals facing away from the viewer render
/// black.
pub fn needle_to_rgb(normals: &Field<[f32; 3]>) -> Field<[f32; 3]> {
    normals.map(|n| {
        if n[2] < 0.0 {
            [0.0, 0.0, 0.0]
        } else {
            [
                (0.5 * (n[0] + 1.0)).clamp(0.0, 1.0),
                (0.5 * (n[1] + 1.0)).clamp(0.0, 1.0),
                n[2].clamp(0.0, 1.0),
            ]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lambertian_shading() {
        let mut normals = Field::filled(2, 1, [0.0f32, 0.0, 1.0]);
        normals.set(1, 0, [1.0, 0.0, 0.0]);
        let light = Vector3::new(0.0, 0.0, 1.0);
        let img = render_needle_map(&normals, &light, 0.8, 0.1);
        // Facing the light: ambient + albedo.
        assert!((*img.get(0, 0) - 0.9).abs() < 1e-6);
        // Perpendicular: ambient only, no negative shading.
        assert!((*img.get(1, 0) - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_zero_normal_shades_ambient() {
        let normals = Field::filled(1, 1, [0.0f32; 3]);
        let img = render_needle_map(&normals, &Vector3::new(0.0, 0.0, 1.0), 1.0, 0.25);
        assert!((*img.get(0, 0) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_rgb_packing() {
        let normals = Field::filled(1, 1, [0.0f32, 0.0, 1.0]);
        let rgb = needle_to_rgb(&normals);
        assert_eq!(*rgb.get(0, 0), [0.5, 0.5, 1.0]);
        let away = Field::filled(1, 1, [0.0f32, 0.0, -1.0]);
        assert_eq!(*needle_to_rgb(&away).get(0, 0), [0.0, 0.0, 0.0]);
    }
}
