//! Iterative solvers shared by the vision crates.
//!
//! Dense and sparse Levenberg-Marquardt for non-linear least squares,
//! a V-cycle multigrid solver for grid-shaped linear systems, and loopy
//! belief propagation on 2D grids.

pub mod bp2d;
pub mod lm;
pub mod multigrid;
pub mod sparse_lm;

pub use bp2d::*;
pub use lm::*;
pub use multigrid::*;
pub use sparse_lm::*;

pub use argus_core::{Error, Result};
