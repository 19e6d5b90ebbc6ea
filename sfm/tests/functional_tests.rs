use argus_core::Progress;
use argus_sfm::{triangulate_dlt, BaProblem, Intrinsics};
use nalgebra::{Point2, Point3, Rotation3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn scene_points() -> Vec<Point3<f64>> {
    vec![
        Point3::new(0.2, -0.1, 5.0),
        Point3::new(-0.6, 0.4, 6.5),
        Point3::new(0.8, 0.3, 4.2),
        Point3::new(-0.2, -0.5, 7.0),
        Point3::new(0.5, 0.6, 5.5),
        Point3::new(-0.9, -0.2, 6.0),
        Point3::new(0.1, 0.9, 4.8),
        Point3::new(0.7, -0.7, 6.8),
    ]
}

fn scene_cameras() -> Vec<(Rotation3<f64>, Vector3<f64>)> {
    vec![
        (Rotation3::identity(), Vector3::zeros()),
        (
            Rotation3::from_axis_angle(&Vector3::y_axis(), 0.1),
            Vector3::new(-0.5, 0.0, 0.2),
        ),
        (
            Rotation3::from_axis_angle(&Vector3::x_axis(), -0.1),
            Vector3::new(0.3, -0.2, 0.1),
        ),
    ]
}

fn observe(pose: &(Rotation3<f64>, Vector3<f64>), p: &Point3<f64>) -> Point2<f64> {
    let pc = pose.0 * p + pose.1;
    Point2::new(pc.x / pc.z, pc.y / pc.z)
}

#[test]
fn bundle_adjustment_recovers_a_perturbed_scene() {
    let mut rng = StdRng::seed_from_u64(7);
    let points = scene_points();
    let cameras = scene_cameras();

    let mut problem = BaProblem::new();
    for (i, cam) in cameras.iter().enumerate() {
        let jitter = if i == 0 {
            Vector3::zeros()
        } else {
            Vector3::new(
                rng.random_range(-0.01..0.01),
                rng.random_range(-0.01..0.01),
                rng.random_range(-0.01..0.01),
            )
        };
        problem.add_camera(cam.0, cam.1 + jitter);
    }
    problem.fix_camera(0).unwrap();

    for p in &points {
        let jitter = Vector3::new(
            rng.random_range(-0.05..0.05),
            rng.random_range(-0.05..0.05),
            rng.random_range(-0.05..0.05),
        );
        let i = problem.add_point(p + jitter);
        for (c, cam) in cameras.iter().enumerate() {
            problem.add_observation(c, i, observe(cam, p)).unwrap();
        }
    }

    let start = problem.rms_reprojection_error();
    assert!(start > 1e-3, "perturbation too small to test anything");

    let rms = problem.bundle_adjust(&mut Progress::silent()).unwrap();
    assert!(rms < 1e-6, "rms {}", rms);
    assert!((problem.rms_reprojection_error() - rms).abs() < 1e-9);

    // The anchored camera must not have moved.
    let (rot, t) = problem.camera(0);
    assert!(rot.angle() < 1e-12);
    assert!(t.norm() < 1e-12);
}

#[test]
fn triangulation_seeds_bundle_adjustment() {
    let cameras = scene_cameras();
    let intr = Intrinsics::default();

    let mut problem = BaProblem::new();
    for cam in &cameras {
        problem.add_camera(cam.0, cam.1);
    }
    problem.fix_camera(0).unwrap();
    problem.fix_camera(1).unwrap();

    for p in &scene_points() {
        let obs: Vec<_> = cameras.iter().map(|c| observe(c, p)).collect();
        let seed = triangulate_dlt(&cameras, &obs, &intr).unwrap();
        assert!((seed - p).norm() < 1e-6);
        let i = problem.add_point(seed);
        for (c, o) in obs.into_iter().enumerate() {
            problem.add_observation(c, i, o).unwrap();
        }
    }

    let rms = problem.bundle_adjust(&mut Progress::silent()).unwrap();
    assert!(rms < 1e-8, "rms {}", rms);
}
