//! Sparse feature detection: SIFT keypoints with descriptors and MSER
//! stable extremal regions.

pub mod mser;
pub mod sift;

pub use mser::*;
pub use sift::*;

pub use argus_core::{Error, Result};
