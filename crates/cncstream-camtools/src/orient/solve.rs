//! Least-squares rigid fit between design and machine markers

use nalgebra::{Isometry2, Point2, Rotation2, Vector2};
use serde::{Deserialize, Serialize};

use crate::error::OrientError;

/// A design point and where it was found on the machine
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub design: Point2<f64>,
    pub machine: Point2<f64>,
}

impl Marker {
    pub fn new(design_x: f64, design_y: f64, machine_x: f64, machine_y: f64) -> Self {
        Self {
            design: Point2::new(design_x, design_y),
            machine: Point2::new(machine_x, machine_y),
        }
    }
}

/// Residual statistics over all markers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ErrorStats {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
}

/// Rotation about the origin followed by a translation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrientationSolution {
    /// Radians, counter-clockwise
    pub angle: f64,
    pub offset: Vector2<f64>,
    /// Distance between each transformed design point and its machine point
    pub residuals: Vec<f64>,
}

impl OrientationSolution {
    pub fn angle_degrees(&self) -> f64 {
        self.angle.to_degrees()
    }

    pub fn rotation(&self) -> Rotation2<f64> {
        Rotation2::new(self.angle)
    }

    pub fn isometry(&self) -> Isometry2<f64> {
        Isometry2::new(self.offset, self.angle)
    }

    /// Design coordinates to machine coordinates
    pub fn transform_point(&self, x: f64, y: f64) -> (f64, f64) {
        let p = self.isometry() * Point2::new(x, y);
        (p.x, p.y)
    }

    /// Machine coordinates back to design coordinates
    pub fn inverse_point(&self, x: f64, y: f64) -> (f64, f64) {
        let p = self.isometry().inverse() * Point2::new(x, y);
        (p.x, p.y)
    }

    /// Rotate a relative vector (incremental move, arc offset)
    pub fn rotate_vector(&self, dx: f64, dy: f64) -> (f64, f64) {
        let v = self.rotation() * Vector2::new(dx, dy);
        (v.x, v.y)
    }

    pub fn error(&self) -> ErrorStats {
        let min = self.residuals.iter().copied().fold(f64::INFINITY, f64::min);
        let max = self.residuals.iter().copied().fold(0.0, f64::max);
        let avg = self.residuals.iter().sum::<f64>() / self.residuals.len().max(1) as f64;
        ErrorStats {
            min: if min.is_finite() { min } else { 0.0 },
            avg,
            max,
        }
    }
}

const DEGENERATE_SPREAD: f64 = 1e-12;

/// Fit the rigid transform that maps design points onto machine points
///
/// Both point sets are centered on their centroids; the rotation is
/// `atan2(Σ cross, Σ dot)` of the centered pairs and the offset maps the
/// rotated design centroid onto the machine centroid.
pub fn solve(markers: &[Marker]) -> Result<OrientationSolution, OrientError> {
    if markers.len() < 2 {
        return Err(OrientError::InsufficientMarkers {
            count: markers.len(),
        });
    }

    let n = markers.len() as f64;
    let design_centroid = markers.iter().fold(Vector2::zeros(), |acc, m| acc + m.design.coords) / n;
    let machine_centroid = markers.iter().fold(Vector2::zeros(), |acc, m| acc + m.machine.coords) / n;

    let (mut dot, mut cross) = (0.0, 0.0);
    let (mut design_spread, mut machine_spread) = (0.0, 0.0);
    for m in markers {
        let d = m.design.coords - design_centroid;
        let p = m.machine.coords - machine_centroid;
        dot += d.dot(&p);
        cross += d.perp(&p);
        design_spread += d.norm_squared();
        machine_spread += p.norm_squared();
    }
    if design_spread < DEGENERATE_SPREAD
        || machine_spread < DEGENERATE_SPREAD
        || dot.hypot(cross) < 1e-9 * (design_spread * machine_spread).sqrt()
    {
        return Err(OrientError::DegenerateMarkerSet);
    }

    let angle = cross.atan2(dot);
    let rotation = Rotation2::new(angle);
    let offset = machine_centroid - rotation * design_centroid;

    let isometry = Isometry2::new(offset, angle);
    let residuals = markers
        .iter()
        .map(|m| (isometry * m.design - m.machine).norm())
        .collect();

    Ok(OrientationSolution {
        angle,
        offset,
        residuals,
    })
}
