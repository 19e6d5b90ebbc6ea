use nalgebra::{DVector, Point2, Point3, Rotation3, Vector3};

use argus_core::Progress;
use argus_optimize::SparseLm;

use crate::{Error, Result};

/// Pinhole intrinsics shared by every camera in a problem. The default is
/// the identity camera: focal length one, principal point at the origin.
#[derive(Debug, Clone, Copy)]
pub struct Intrinsics {
    pub focal: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Default for Intrinsics {
    fn default() -> Self {
        Self {
            focal: 1.0,
            cx: 0.0,
            cy: 0.0,
        }
    }
}

impl Intrinsics {
    /// Projects a point given in camera coordinates; `None` behind the
    /// camera.
    pub fn project(&self, pc: &Point3<f64>) -> Option<Point2<f64>> {
        if pc.z <= 1e-12 {
            return None;
        }
        Some(Point2::new(
            self.focal * pc.x / pc.z + self.cx,
            self.focal * pc.y / pc.z + self.cy,
        ))
    }
}

struct Observation {
    camera: usize,
    point: usize,
    projection: Point2<f64>,
}

/// A bundle adjustment problem: camera poses stored as 6-vectors (axis-angle
/// rotation then translation), points as 3-vectors, and 2D observations each
/// tying one camera to one point.
///
/// Every camera and every point must carry at least one observation before
/// [`BaProblem::bundle_adjust`] runs, and a (camera, point) pair can only be
/// observed once.
#[derive(Default)]
pub struct BaProblem {
    intrinsics: Intrinsics,
    cameras: Vec<[f64; 6]>,
    fixed: Vec<bool>,
    points: Vec<Point3<f64>>,
    observations: Vec<Observation>,
}

impl BaProblem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_intrinsics(mut self, intrinsics: Intrinsics) -> Self {
        self.intrinsics = intrinsics;
        self
    }

    pub fn intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }

    pub fn add_camera(&mut self, rotation: Rotation3<f64>, translation: Vector3<f64>) -> usize {
        let axis = rotation.scaled_axis();
        self.cameras.push([
            axis.x,
            axis.y,
            axis.z,
            translation.x,
            translation.y,
            translation.z,
        ]);
        self.fixed.push(false);
        self.cameras.len() - 1
    }

    /// Pins a camera to its current pose, typically the first camera to
    /// anchor the gauge.
    pub fn fix_camera(&mut self, camera: usize) -> Result<()> {
        match self.fixed.get_mut(camera) {
            Some(f) => {
                *f = true;
                Ok(())
            }
            None => Err(Error::InvalidParameter(format!(
                "camera {} out of range",
                camera
            ))),
        }
    }

    pub fn add_point(&mut self, point: Point3<f64>) -> usize {
        self.points.push(point);
        self.points.len() - 1
    }

    pub fn add_observation(
        &mut self,
        camera: usize,
        point: usize,
        projection: Point2<f64>,
    ) -> Result<()> {
        if camera >= self.cameras.len() || point >= self.points.len() {
            return Err(Error::InvalidParameter(format!(
                "observation references (camera {}, point {}) outside ({}, {})",
                camera,
                point,
                self.cameras.len(),
                self.points.len()
            )));
        }
        self.observations.push(Observation {
            camera,
            point,
            projection,
        });
        Ok(())
    }

    pub fn num_cameras(&self) -> usize {
        self.cameras.len()
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn camera(&self, camera: usize) -> (Rotation3<f64>, Vector3<f64>) {
        let c = &self.cameras[camera];
        (
            Rotation3::new(Vector3::new(c[0], c[1], c[2])),
            Vector3::new(c[3], c[4], c[5]),
        )
    }

    pub fn point(&self, point: usize) -> Point3<f64> {
        self.points[point]
    }

    /// Root-mean-square reprojection error over all observations, in the
    /// same units as the projections. Points behind a camera count a fixed
    /// large error.
    pub fn rms_reprojection_error(&self) -> f64 {
        if self.observations.is_empty() {
            return 0.0;
        }
        let mut sum = 0.0;
        for obs in &self.observations {
            let (rot, t) = self.camera(obs.camera);
            let pc = rot * self.points[obs.point] + t;
            match self.intrinsics.project(&pc) {
                Some(p) => sum += (p - obs.projection).norm_squared(),
                None => sum += 2.0 * BEHIND_CAMERA_ERROR * BEHIND_CAMERA_ERROR,
            }
        }
        (sum / self.observations.len() as f64).sqrt()
    }

    /// Refines all unfixed camera poses and all points to minimise the
    /// reprojection error, returning the final RMS error.
    ///
    /// Cameras go into the A list and points into the B list of a
    /// Schur-complement [`SparseLm`], with one 2-vector residual term per
    /// observation.
    pub fn bundle_adjust(&mut self, prog: &mut Progress) -> Result<f64> {
        let mut cam_seen = vec![false; self.cameras.len()];
        let mut point_seen = vec![false; self.points.len()];
        for obs in &self.observations {
            cam_seen[obs.camera] = true;
            point_seen[obs.point] = true;
        }
        if let Some(i) = cam_seen.iter().position(|&s| !s) {
            return Err(Error::InvalidParameter(format!(
                "camera {} has no observations",
                i
            )));
        }
        if let Some(i) = point_seen.iter().position(|&s| !s) {
            return Err(Error::InvalidParameter(format!(
                "point {} has no observations",
                i
            )));
        }

        let mut slm = SparseLm::new(6, 3, 2);
        for cam in &self.cameras {
            slm.add_block_a(DVector::from_column_slice(cam))?;
        }
        for p in &self.points {
            slm.add_block_b(DVector::from_vec(vec![p.x, p.y, p.z]))?;
        }

        let intr = self.intrinsics;
        for obs in &self.observations {
            let m = DVector::from_vec(vec![obs.projection.x, obs.projection.y]);
            slm.add_term(
                obs.camera,
                obs.point,
                m,
                Box::new(move |a, b, m, err| {
                    let rot = Rotation3::new(Vector3::new(a[0], a[1], a[2]));
                    let pc = rot * Point3::new(b[0], b[1], b[2]) + Vector3::new(a[3], a[4], a[5]);
                    match intr.project(&pc) {
                        Some(p) => {
                            err[0] = p.x - m[0];
                            err[1] = p.y - m[1];
                        }
                        None => {
                            err[0] = BEHIND_CAMERA_ERROR;
                            err[1] = BEHIND_CAMERA_ERROR;
                        }
                    }
                }),
            )?;
        }

        for (i, &fixed) in self.fixed.iter().enumerate() {
            if fixed {
                let pose = self.cameras[i];
                slm.set_constraint_a(
                    i,
                    Box::new(move |v| {
                        for (k, &p) in pose.iter().enumerate() {
                            v[k] = p;
                        }
                    }),
                );
            }
        }

        let residual = slm.run(prog)?;

        for (i, cam) in self.cameras.iter_mut().enumerate() {
            let blk = slm.block_a(i);
            for (k, c) in cam.iter_mut().enumerate() {
                *c = blk[k];
            }
        }
        for (i, p) in self.points.iter_mut().enumerate() {
            let blk = slm.block_b(i);
            *p = Point3::new(blk[0], blk[1], blk[2]);
        }

        let rms = residual / (self.observations.len() as f64).sqrt();
        tracing::debug!(
            cameras = self.cameras.len(),
            points = self.points.len(),
            observations = self.observations.len(),
            rms,
            "bundle adjustment done"
        );
        Ok(rms)
    }
}

const BEHIND_CAMERA_ERROR: f64 = 1e3;
