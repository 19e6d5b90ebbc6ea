use argus_core::Field;

use crate::{DisparityMap, Error, Result};

/// Zeroes the disparity of every pixel flagged invalid, so downstream
/// consumers that ignore the mask read a harmless value instead of
/// whatever the matcher left behind.
pub fn fill_invalid(disp: &mut Field<f32>, valid: &Field<bool>) -> Result<()> {
    if !disp.same_size(valid) {
        return Err(Error::DimensionMismatch(
            "disparity and validity mask differ in size".into(),
        ));
    }
    for (d, v) in disp.as_mut_slice().iter_mut().zip(valid.as_slice()) {
        if !v {
            *d = 0.0;
        }
    }
    Ok(())
}

/// Affine rescale of a field onto [0, 1]. A constant field maps to all
/// zeros rather than dividing by nothing.
pub fn normalise(field: &mut Field<f32>) {
    let (lo, hi) = field.min_max();
    let range = hi - lo;
    if range <= 0.0 || !range.is_finite() {
        for v in field.as_mut_slice() {
            *v = 0.0;
        }
        return;
    }
    for v in field.as_mut_slice() {
        *v = (*v - lo) / range;
    }
}

/// Renders a disparity map to a displayable grayscale field:
/// `scale * (d - min_disparity)`, clamped to [0, 1]. Invalid pixels render
/// black.
pub fn render_disparity(dm: &DisparityMap, scale: f32) -> Field<f32> {
    Field::from_fn(dm.width(), dm.height(), |x, y| {
        if *dm.valid.get(x, y) {
            (scale * (dm.disp.get(x, y) - dm.min_disparity as f32)).clamp(0.0, 1.0)
        } else {
            0.0
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_invalid_zeroes_only_masked() {
        let mut disp = Field::from_fn(4, 2, |x, y| (x + y) as f32 + 1.0);
        let valid = Field::from_fn(4, 2, |x, _| x % 2 == 0);
        fill_invalid(&mut disp, &valid).unwrap();
        for y in 0..2 {
            for x in 0..4 {
                if x % 2 == 0 {
                    assert!(*disp.get(x, y) > 0.0);
                } else {
                    assert_eq!(*disp.get(x, y), 0.0);
                }
            }
        }
    }

    #[test]
    fn test_fill_invalid_size_checked() {
        let mut disp = Field::<f32>::new(4, 4);
        let valid = Field::<bool>::new(4, 5);
        assert!(fill_invalid(&mut disp, &valid).is_err());
    }

    #[test]
    fn test_normalise_range() {
        let mut f = Field::from_fn(5, 1, |x, _| x as f32 * 2.0 + 3.0);
        normalise(&mut f);
        assert_eq!(*f.get(0, 0), 0.0);
        assert_eq!(*f.get(4, 0), 1.0);
        assert!((*f.get(2, 0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_normalise_constant_field() {
        let mut f = Field::filled(3, 3, 7.0f32);
        normalise(&mut f);
        assert!(f.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_render_scales_and_masks() {
        let mut dm = DisparityMap::new(2, 1, -4, 4);
        dm.disp.set(0, 0, 0.0);
        dm.valid.set(0, 0, true);
        dm.disp.set(1, 0, 4.0);
        dm.valid.set(1, 0, false);
        let img = render_disparity(&dm, 1.0 / 8.0);
        assert!((*img.get(0, 0) - 0.5).abs() < 1e-6);
        assert_eq!(*img.get(1, 0), 0.0);
    }
}
