pub use argus_core as core;
pub use argus_features as features;
pub use argus_mesh as mesh;
pub use argus_optimize as optimize;
pub use argus_segment as segment;
pub use argus_sfm as sfm;
pub use argus_sfs as sfs;
pub use argus_stereo as stereo;
