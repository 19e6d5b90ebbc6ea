//! Stereo matching and disparity map processing.
//!
//! Disparity here is the horizontal offset from the left image to the right:
//! a pixel at x in the left image matches x - d in the right. Ranges may be
//! negative for verged rigs, so every matcher carries an explicit
//! [min, max] disparity window.

pub mod block_matching;
pub mod bp_stereo;
pub mod diffuse_correlation;
pub mod plane_seg;
pub mod postproc;

pub use block_matching::*;
pub use bp_stereo::*;
pub use diffuse_correlation::*;
pub use plane_seg::*;
pub use postproc::*;

pub use argus_core::{Error, Result};
use argus_core::{Field, Progress};

/// A computed disparity field plus its validity mask. Pixels the matcher
/// could not resolve are flagged false and carry no meaningful disparity.
#[derive(Debug, Clone)]
pub struct DisparityMap {
    pub disp: Field<f32>,
    pub valid: Field<bool>,
    pub min_disparity: i32,
    pub max_disparity: i32,
}

impl DisparityMap {
    pub fn new(width: usize, height: usize, min_disparity: i32, max_disparity: i32) -> Self {
        Self {
            disp: Field::new(width, height),
            valid: Field::new(width, height),
            min_disparity,
            max_disparity,
        }
    }

    pub fn width(&self) -> usize {
        self.disp.width()
    }

    pub fn height(&self) -> usize {
        self.disp.height()
    }

    pub fn valid_count(&self) -> usize {
        self.valid.as_slice().iter().filter(|&&v| v).count()
    }
}

/// Interface every stereo matcher in the crate presents: rectified
/// grayscale left/right fields in, disparity map out.
pub trait StereoMatcher {
    fn compute(
        &self,
        left: &Field<f32>,
        right: &Field<f32>,
        prog: &mut Progress,
    ) -> Result<DisparityMap>;
}
