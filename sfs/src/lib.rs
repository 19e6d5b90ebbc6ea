//! Shape from shading under the Lambertian model.
//!
//! Needle maps are `Field<[f32; 3]>` of unit surface normals, the same
//! layout the [`argus_core::Grid`] Vec3 channel stores.

pub mod lighting;
pub mod needle;
pub mod worthington;

pub use lighting::*;
pub use needle::*;
pub use worthington::*;

pub use argus_core::{Error, Result};
