//! Autolevel: probe a height map and follow it
//!
//! - [`ProbeGrid`] lays out the nodes over the work area
//! - [`Autolevel::scan`] probes them one by one through a [`Prober`]
//! - [`HeightMap`] stores the results and interpolates between nodes
//! - [`compensate`] bends a motion program onto the measured surface

pub mod compensate;
pub mod grid;
pub mod height_map;
pub mod prober;
pub mod scan;

pub use compensate::{compensate, CompensationReport};
pub use grid::{probe_lines, ProbeGrid};
pub use height_map::{HeightMap, Surface};
pub use prober::ControllerProber;
pub use scan::{AbortHandle, Autolevel, Prober, Scan, ScanParams, ScanProgress};
