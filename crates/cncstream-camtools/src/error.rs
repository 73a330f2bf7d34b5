//! Error types for the camtools crate.
//!
//! Autolevel and orientation each get their own error enum; neither touches
//! machine state when it fails.

use std::io;

use cncstream_core::{GcodeError, RunError};
use thiserror::Error;

/// Errors raised while building, scanning or applying a height map.
#[derive(Error, Debug)]
pub enum AutolevelError {
    /// Grid bounds or steps cannot describe a probe grid.
    #[error("Invalid probe grid: {0}")]
    InvalidGrid(String),

    /// Height map does not hold one point per grid node.
    #[error("Height map incomplete: {got} of {expected} points")]
    IncompleteHeightMap { expected: usize, got: usize },

    /// The run controller is busy with another program.
    #[error("Machine busy, cannot probe while a run is active")]
    MachineBusy,

    /// No probe record arrived in time.
    #[error("Probe at {x:.3},{y:.3} timed out after {timeout_ms} ms")]
    ProbeTimeout { x: f64, y: f64, timeout_ms: u64 },

    /// The probing run ended without reporting a contact record.
    #[error("No probe record for {x:.3},{y:.3}")]
    NoProbeRecord { x: f64, y: f64 },

    /// The probing program could not be started.
    #[error("Probe run failed: {0}")]
    Run(#[from] RunError),

    /// Program could not be interpreted.
    #[error("Program error: {0}")]
    Program(#[from] GcodeError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the orientation solver and marker session.
#[derive(Error, Debug)]
pub enum OrientError {
    /// Fewer than two markers.
    #[error("At least 2 markers are required, got {count}")]
    InsufficientMarkers { count: usize },

    /// Rotation is undetermined (coincident design or machine points).
    #[error("Degenerate marker set, rotation cannot be determined")]
    DegenerateMarkerSet,

    /// `apply` called before a successful solve.
    #[error("Orientation not solved")]
    NotSolved,

    #[error("Marker {index} out of range ({len} markers)")]
    MarkerOutOfRange { index: usize, len: usize },

    /// A capture is already open.
    #[error("Marker capture already in progress")]
    CaptureInProgress,

    /// Commit or capture without an open capture, or commit before capturing.
    #[error("No marker captured")]
    NoCapture,

    #[error("Program error: {0}")]
    Program(#[from] GcodeError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for autolevel operations.
pub type AutolevelResult<T> = Result<T, AutolevelError>;

/// Result type alias for orientation operations.
pub type OrientResult<T> = Result<T, OrientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_autolevel_error_display() {
        let err = AutolevelError::IncompleteHeightMap {
            expected: 9,
            got: 4,
        };
        assert_eq!(err.to_string(), "Height map incomplete: 4 of 9 points");

        let err = AutolevelError::ProbeTimeout {
            x: 1.0,
            y: 2.5,
            timeout_ms: 500,
        };
        assert_eq!(err.to_string(), "Probe at 1.000,2.500 timed out after 500 ms");
    }

    #[test]
    fn test_orient_error_display() {
        let err = OrientError::InsufficientMarkers { count: 1 };
        assert_eq!(err.to_string(), "At least 2 markers are required, got 1");
    }

    #[test]
    fn test_error_conversion() {
        let err: AutolevelError = RunError::NotConnected.into();
        assert!(matches!(err, AutolevelError::Run(RunError::NotConnected)));

        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err: OrientError = io_err.into();
        assert!(matches!(err, OrientError::Io(_)));
    }
}
