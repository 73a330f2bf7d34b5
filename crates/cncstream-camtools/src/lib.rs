//! # cncstream CAM Tools
//!
//! Operations that reshape a motion program to fit the real workpiece:
//!
//! - **Autolevel**: probe a height map over a grid and compensate program Z
//!   so the tool follows the measured surface
//! - **Orientation**: fit the rotation and offset between design and machine
//!   frames from marker pairs and transform program blocks

pub mod autolevel;
pub mod error;
pub mod orient;

pub use autolevel::{
    compensate, AbortHandle, Autolevel, CompensationReport, ControllerProber, HeightMap,
    ProbeGrid, Prober, Scan, ScanParams, ScanProgress,
};
pub use error::{AutolevelError, AutolevelResult, OrientError, OrientResult};
pub use orient::{ErrorStats, Marker, Orientation, OrientationSolution};
