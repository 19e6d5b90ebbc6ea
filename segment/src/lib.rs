//! Image segmentation by mean shift.

pub mod mean_shift;

pub use mean_shift::*;

pub use argus_core::{Error, Result};
