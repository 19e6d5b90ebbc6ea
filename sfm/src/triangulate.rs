use nalgebra::{DMatrix, Matrix3, Matrix3x4, Point2, Point3, Rotation3, Vector3};

use crate::{Error, Intrinsics, Result};

/// Builds the 3x4 projection matrix K [R | t] for one camera.
fn projection_matrix(
    intrinsics: &Intrinsics,
    rotation: &Rotation3<f64>,
    translation: &Vector3<f64>,
) -> Matrix3x4<f64> {
    let k = Matrix3::new(
        intrinsics.focal,
        0.0,
        intrinsics.cx,
        0.0,
        intrinsics.focal,
        intrinsics.cy,
        0.0,
        0.0,
        1.0,
    );
    let mut rt = Matrix3x4::zeros();
    rt.fixed_view_mut::<3, 3>(0, 0).copy_from(rotation.matrix());
    rt.fixed_view_mut::<3, 1>(0, 3).copy_from(translation);
    k * rt
}

/// Direct linear transform triangulation of one point seen from two or more
/// calibrated views. `poses` and `observations` pair up by index.
///
/// Each view contributes two rows of the homogeneous system `A X = 0`; the
/// least-squares solution is the right singular vector of the smallest
/// singular value. Fails when fewer than two views are given or when the
/// solution sits at infinity.
pub fn triangulate_dlt(
    poses: &[(Rotation3<f64>, Vector3<f64>)],
    observations: &[Point2<f64>],
    intrinsics: &Intrinsics,
) -> Result<Point3<f64>> {
    if poses.len() != observations.len() {
        return Err(Error::DimensionMismatch(format!(
            "{} poses but {} observations",
            poses.len(),
            observations.len()
        )));
    }
    if poses.len() < 2 {
        return Err(Error::InvalidParameter(
            "triangulation needs at least two views".into(),
        ));
    }

    let mut a = DMatrix::zeros(2 * poses.len(), 4);
    for (i, ((rot, t), obs)) in poses.iter().zip(observations).enumerate() {
        let p = projection_matrix(intrinsics, rot, t);
        for j in 0..4 {
            a[(2 * i, j)] = obs.x * p[(2, j)] - p[(0, j)];
            a[(2 * i + 1, j)] = obs.y * p[(2, j)] - p[(1, j)];
        }
    }

    let svd = a.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| Error::NumericalFailure("SVD of the DLT system failed".into()))?;
    let h = v_t.row(v_t.nrows() - 1);
    if h[3].abs() < 1e-12 {
        return Err(Error::NumericalFailure(
            "triangulated point at infinity".into(),
        ));
    }
    Ok(Point3::new(h[0] / h[3], h[1] / h[3], h[2] / h[3]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observe(
        intrinsics: &Intrinsics,
        pose: &(Rotation3<f64>, Vector3<f64>),
        p: &Point3<f64>,
    ) -> Point2<f64> {
        let pc = pose.0 * p + pose.1;
        Point2::new(
            intrinsics.focal * pc.x / pc.z + intrinsics.cx,
            intrinsics.focal * pc.y / pc.z + intrinsics.cy,
        )
    }

    #[test]
    fn test_two_view_triangulation_is_exact() {
        let intr = Intrinsics::default();
        let poses = [
            (Rotation3::identity(), Vector3::zeros()),
            (Rotation3::identity(), Vector3::new(-1.0, 0.0, 0.0)),
        ];
        let truth = Point3::new(0.5, 0.2, 4.0);
        let obs: Vec<_> = poses.iter().map(|p| observe(&intr, p, &truth)).collect();
        let p = triangulate_dlt(&poses, &obs, &intr).unwrap();
        assert!((p - truth).norm() < 1e-9, "got {:?}", p);
    }

    #[test]
    fn test_three_views_with_rotation() {
        let intr = Intrinsics {
            focal: 500.0,
            cx: 320.0,
            cy: 240.0,
        };
        let poses = [
            (Rotation3::identity(), Vector3::zeros()),
            (
                Rotation3::from_axis_angle(&Vector3::y_axis(), 0.1),
                Vector3::new(-0.8, 0.0, 0.1),
            ),
            (
                Rotation3::from_axis_angle(&Vector3::x_axis(), -0.05),
                Vector3::new(0.4, -0.3, 0.0),
            ),
        ];
        let truth = Point3::new(-0.3, 0.6, 5.0);
        let obs: Vec<_> = poses.iter().map(|p| observe(&intr, p, &truth)).collect();
        let p = triangulate_dlt(&poses, &obs, &intr).unwrap();
        assert!((p - truth).norm() < 1e-6, "got {:?}", p);
    }

    #[test]
    fn test_one_view_rejected() {
        let intr = Intrinsics::default();
        let poses = [(Rotation3::identity(), Vector3::zeros())];
        let obs = [Point2::new(0.0, 0.0)];
        assert!(triangulate_dlt(&poses, &obs, &intr).is_err());
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let intr = Intrinsics::default();
        let poses = [
            (Rotation3::identity(), Vector3::zeros()),
            (Rotation3::identity(), Vector3::new(-1.0, 0.0, 0.0)),
        ];
        let obs = [Point2::new(0.0, 0.0)];
        assert!(triangulate_dlt(&poses, &obs, &intr).is_err());
    }
}
