//! Rectangular probe grid

use cncstream_core::{format_number, MachineStateBus};
use cncstream_settings::AutolevelSettings;
use serde::{Deserialize, Serialize};

use crate::error::AutolevelError;

/// Grid of probe nodes over a rectangle
///
/// Nodes are stored row-major: `index = j * nx + i`, with `i` along X and
/// `j` along Y. The actual step is the span divided evenly between the nodes
/// and can be smaller than the requested one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbeGrid {
    pub xmin: f64,
    pub xmax: f64,
    pub ymin: f64,
    pub ymax: f64,
    pub nx: usize,
    pub ny: usize,
}

fn check_span(axis: char, min: f64, max: f64) -> Result<(), AutolevelError> {
    if !(min.is_finite() && max.is_finite()) {
        return Err(AutolevelError::InvalidGrid(format!("{axis} bounds must be finite")));
    }
    if max <= min {
        return Err(AutolevelError::InvalidGrid(format!(
            "{axis}max {max} must be greater than {axis}min {min}"
        )));
    }
    Ok(())
}

fn node_count(axis: char, min: f64, max: f64, step: f64) -> Result<usize, AutolevelError> {
    check_span(axis, min, max)?;
    if !step.is_finite() || step <= 0.0 {
        return Err(AutolevelError::InvalidGrid(format!(
            "{axis} step must be positive, got {step}"
        )));
    }
    let intervals = ((max - min) / step - 1e-9).ceil().max(1.0);
    Ok(intervals as usize + 1)
}

impl ProbeGrid {
    /// Grid covering the bounds with at most the requested steps
    pub fn new(
        xmin: f64,
        xmax: f64,
        ymin: f64,
        ymax: f64,
        step_x: f64,
        step_y: f64,
    ) -> Result<Self, AutolevelError> {
        Ok(Self {
            xmin,
            xmax,
            ymin,
            ymax,
            nx: node_count('x', xmin, xmax, step_x)?,
            ny: node_count('y', ymin, ymax, step_y)?,
        })
    }

    pub fn from_settings(settings: &AutolevelSettings) -> Result<Self, AutolevelError> {
        Self::new(
            settings.xmin,
            settings.xmax,
            settings.ymin,
            settings.ymax,
            settings.step_x,
            settings.step_y,
        )
    }

    /// Grid over the XY bounds of the loaded program
    pub fn from_margins(
        state: &MachineStateBus,
        step_x: f64,
        step_y: f64,
    ) -> Result<Self, AutolevelError> {
        let bounds = state
            .read(|s| s.program_bounds)
            .ok_or_else(|| AutolevelError::InvalidGrid("no program bounds published".into()))?;
        Self::new(
            bounds.min.x,
            bounds.max.x,
            bounds.min.y,
            bounds.max.y,
            step_x,
            step_y,
        )
    }

    /// Rapid moves around the grid outline at height `z`
    ///
    /// Lets the operator check the area before probing. Starts and ends at
    /// the `xmin`/`ymin` corner.
    pub fn margin_lines(&self, z: f64) -> Vec<String> {
        let corner = |x: f64, y: f64| format!("G0 X{} Y{}", format_number(x), format_number(y));
        vec![
            "G90".to_string(),
            format!("G0 Z{}", format_number(z)),
            corner(self.xmin, self.ymin),
            corner(self.xmin, self.ymax),
            corner(self.xmax, self.ymax),
            corner(self.xmax, self.ymin),
            corner(self.xmin, self.ymin),
        ]
    }

    /// Check a grid that did not come from [`ProbeGrid::new`]
    pub fn validate(&self) -> Result<(), AutolevelError> {
        check_span('x', self.xmin, self.xmax)?;
        check_span('y', self.ymin, self.ymax)?;
        if self.nx < 2 || self.ny < 2 {
            return Err(AutolevelError::InvalidGrid(format!(
                "{}x{} nodes, at least 2x2 required",
                self.nx, self.ny
            )));
        }
        Ok(())
    }

    pub fn step_x(&self) -> f64 {
        (self.xmax - self.xmin) / (self.nx - 1) as f64
    }

    pub fn step_y(&self) -> f64 {
        (self.ymax - self.ymin) / (self.ny - 1) as f64
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nx * self.ny
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn index(&self, i: usize, j: usize) -> usize {
        j * self.nx + i
    }

    /// Column and row of a row-major index
    pub fn coords(&self, index: usize) -> (usize, usize) {
        (index % self.nx, index / self.nx)
    }

    /// XY position of a node
    pub fn node(&self, i: usize, j: usize) -> (f64, f64) {
        (
            self.xmin + i as f64 * self.step_x(),
            self.ymin + j as f64 * self.step_y(),
        )
    }

    /// Node positions in scan order
    pub fn nodes(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        (0..self.len()).map(|k| {
            let (i, j) = self.coords(k);
            self.node(i, j)
        })
    }

    /// Smallest node spacing, used as the subdivision length
    pub fn min_step(&self) -> f64 {
        self.step_x().min(self.step_y())
    }
}

/// Program that probes one node
///
/// Rapid to `z_max`, move over the node, probe down to `z_min` and retract.
/// The `%wait` barriers make the probe record current before the next
/// point starts.
pub fn probe_lines(x: f64, y: f64, z_min: f64, z_max: f64, feed: f64, command: &str) -> Vec<String> {
    vec![
        "G90".to_string(),
        format!("G0 Z{}", format_number(z_max)),
        format!("G0 X{} Y{}", format_number(x), format_number(y)),
        "%wait".to_string(),
        format!("{} Z{} F{}", command, format_number(z_min), format_number(feed)),
        "%wait".to_string(),
        format!("G0 Z{}", format_number(z_max)),
    ]
}
