//! Calibrated tetrahedral meshing of segmented CT surfaces, with intensity
//! based material mapping and finite-element exports.

pub mod calibration;
pub mod config;
pub mod datatypes;
pub mod error;
pub mod exporter;
pub mod geometry;
pub mod intensity;
pub mod material;
pub mod mesher;
pub mod pipeline;
pub mod quality;
pub mod remesher;
pub mod surface_calibrator;
pub mod volume_calibrator;

pub use error::{CalimeshError, Result};
