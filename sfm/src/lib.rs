//! Structure from motion: a bundle adjustment problem that refines camera
//! poses and 3D points jointly from their 2D projections, plus DLT
//! triangulation for seeding the points.

pub mod ba;
pub mod triangulate;

pub use ba::*;
pub use triangulate::*;

pub use argus_core::{Error, Result};
