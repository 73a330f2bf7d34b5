//! Measured surface heights
//!
//! A [`HeightMap`] holds one [`ProbePoint`] per grid node. Failed points stay
//! in the map; lookups substitute the nearest valid neighbor so that
//! compensation always has a height, at reduced accuracy.

use std::fs;
use std::path::Path;

use cncstream_core::{Position, ProbePoint};
use serde::{Deserialize, Serialize};

use super::grid::ProbeGrid;
use crate::error::AutolevelError;

/// Probe results over a [`ProbeGrid`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeightMap {
    grid: ProbeGrid,
    points: Vec<ProbePoint>,
}

impl HeightMap {
    /// Empty map for a grid
    pub fn new(grid: ProbeGrid) -> Self {
        Self {
            grid,
            points: Vec::with_capacity(grid.len()),
        }
    }

    /// Map from a complete set of row-major points
    pub fn from_points(grid: ProbeGrid, points: Vec<ProbePoint>) -> Result<Self, AutolevelError> {
        if points.len() != grid.len() {
            return Err(AutolevelError::IncompleteHeightMap {
                expected: grid.len(),
                got: points.len(),
            });
        }
        Ok(Self { grid, points })
    }

    /// Map of successful contacts at the given row-major heights
    pub fn from_heights(grid: ProbeGrid, heights: &[f64]) -> Result<Self, AutolevelError> {
        let points = grid
            .nodes()
            .zip(heights)
            .map(|((x, y), z)| {
                let position = Position::new(x, y, *z);
                ProbePoint {
                    position,
                    target: position,
                    success: true,
                }
            })
            .collect();
        Self::from_points(grid, points)
    }

    pub fn grid(&self) -> &ProbeGrid {
        &self.grid
    }

    pub fn points(&self) -> &[ProbePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// One point per grid node
    pub fn is_complete(&self) -> bool {
        self.points.len() == self.grid.len()
    }

    pub(crate) fn push(&mut self, point: ProbePoint) {
        self.points.push(point);
    }

    pub(crate) fn clear(&mut self) {
        self.points.clear();
    }

    fn check_complete(&self) -> Result<(), AutolevelError> {
        if self.is_complete() {
            Ok(())
        } else {
            Err(AutolevelError::IncompleteHeightMap {
                expected: self.grid.len(),
                got: self.points.len(),
            })
        }
    }

    /// Grid nodes whose probe made no contact
    pub fn degraded_points(&self) -> Vec<(usize, usize)> {
        self.points
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.success)
            .map(|(k, _)| self.grid.coords(k))
            .collect()
    }

    fn measured(&self, i: usize, j: usize) -> Option<f64> {
        self.points
            .get(self.grid.index(i, j))
            .filter(|p| p.success)
            .map(|p| p.position.z)
    }

    fn average(&self) -> f64 {
        let valid: Vec<f64> = self
            .points
            .iter()
            .filter(|p| p.success)
            .map(|p| p.position.z)
            .collect();
        if valid.is_empty() {
            0.0
        } else {
            valid.iter().sum::<f64>() / valid.len() as f64
        }
    }

    fn nearest_neighbor(&self, i: usize, j: usize) -> Option<f64> {
        let (sx, sy) = (self.grid.step_x(), self.grid.step_y());
        let mut best: Option<(f64, f64)> = None;
        for nj in j.saturating_sub(1)..=(j + 1).min(self.grid.ny - 1) {
            for ni in i.saturating_sub(1)..=(i + 1).min(self.grid.nx - 1) {
                let Some(z) = self.measured(ni, nj) else {
                    continue;
                };
                let dx = (ni as f64 - i as f64) * sx;
                let dy = (nj as f64 - j as f64) * sy;
                let distance = dx * dx + dy * dy;
                if best.map_or(true, |(d, _)| distance < d) {
                    best = Some((distance, z));
                }
            }
        }
        best.map(|(_, z)| z)
    }

    /// Effective height of a node
    ///
    /// A failed node takes the closest valid node among its 8 neighbors, or
    /// the average of all valid nodes, or 0 when nothing was measured.
    pub fn z_at(&self, i: usize, j: usize) -> f64 {
        self.measured(i, j)
            .or_else(|| self.nearest_neighbor(i, j))
            .unwrap_or_else(|| self.average())
    }

    /// Effective heights of every node, row-major
    pub fn resolved(&self) -> Result<Vec<f64>, AutolevelError> {
        self.check_complete()?;
        let average = self.average();
        Ok((0..self.grid.len())
            .map(|k| {
                let (i, j) = self.grid.coords(k);
                self.measured(i, j)
                    .or_else(|| self.nearest_neighbor(i, j))
                    .unwrap_or(average)
            })
            .collect())
    }

    /// Interpolated surface for repeated lookups
    pub fn surface(&self) -> Result<Surface, AutolevelError> {
        Ok(Surface {
            grid: self.grid,
            heights: self.resolved()?,
        })
    }

    /// Bilinear height at a point, clamped to the grid edges
    pub fn interpolate(&self, x: f64, y: f64) -> Result<f64, AutolevelError> {
        Ok(self.surface()?.height(x, y))
    }

    /// Lowest and highest effective heights
    pub fn min_max(&self) -> Option<(f64, f64)> {
        let heights = self.resolved().ok()?;
        let min = heights.iter().copied().fold(f64::INFINITY, f64::min);
        let max = heights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some((min, max))
    }

    /// Shift every height so the first node reads zero
    pub fn set_zero(&mut self) -> Result<(), AutolevelError> {
        self.check_complete()?;
        let offset = self.z_at(0, 0);
        for point in self.points.iter_mut() {
            point.position.z -= offset;
        }
        tracing::info!("Height map zeroed at first node (shift {:.4})", offset);
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, AutolevelError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, AutolevelError> {
        let map: Self = serde_json::from_str(text)?;
        map.grid.validate()?;
        if !map.points.is_empty() {
            map.check_complete()?;
        }
        Ok(map)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), AutolevelError> {
        fs::write(path.as_ref(), self.to_json()?)?;
        tracing::debug!("Saved height map to {}", path.as_ref().display());
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, AutolevelError> {
        Self::from_json(&fs::read_to_string(path)?)
    }
}

/// Resolved heights ready for interpolation
#[derive(Debug, Clone)]
pub struct Surface {
    grid: ProbeGrid,
    heights: Vec<f64>,
}

impl Surface {
    /// Bilinear height between the four nodes around `(x, y)`
    ///
    /// Points outside the grid are clamped to the nearest edge.
    pub fn height(&self, x: f64, y: f64) -> f64 {
        let g = &self.grid;
        let (i, tx) = cell(x, g.xmin, g.step_x(), g.nx);
        let (j, ty) = cell(y, g.ymin, g.step_y(), g.ny);
        let z = |i: usize, j: usize| self.heights[g.index(i, j)];
        let bottom = z(i, j) * (1.0 - tx) + z(i + 1, j) * tx;
        let top = z(i, j + 1) * (1.0 - tx) + z(i + 1, j + 1) * tx;
        bottom * (1.0 - ty) + top * ty
    }

    pub fn grid(&self) -> &ProbeGrid {
        &self.grid
    }
}

/// Cell index and fraction along one axis
fn cell(v: f64, min: f64, step: f64, n: usize) -> (usize, f64) {
    let f = ((v - min) / step).clamp(0.0, (n - 1) as f64);
    let i = (f.floor() as usize).min(n - 2);
    (i, f - i as f64)
}
