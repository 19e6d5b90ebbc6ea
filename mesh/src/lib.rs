//! Indexed triangle meshes and the operations the modelling tools lean on:
//! duplicate-vertex welding, quadric edge-collapse simplification and Loop
//! subdivision.

pub mod simplify;
pub mod subdivide;
pub mod trimesh;

pub use simplify::*;
pub use subdivide::*;
pub use trimesh::*;

pub use argus_core::{Error, Result};
