//! Modal interpreter
//!
//! Tracks the modal groups that matter for coordinate tracking and turns each
//! line into an absolute [`Move`] when it moves the tool. Positions are kept
//! per axis as `Option<f64>`: an axis becomes unknown after a move whose end
//! point cannot be derived from the program alone (homing, machine
//! coordinates, offset changes).

use cncstream_core::{GcodeError, Units};
use serde::{Deserialize, Serialize};

use super::line::{GcodeLine, LineKind};

/// XYZ with possibly unknown axes
pub type Point3 = [Option<f64>; 3];

/// Active motion mode (group 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotionMode {
    Rapid,
    Linear,
    ArcCw,
    ArcCcw,
    /// `G38.2` .. `G38.5`, minor code kept
    Probe(u32),
}

impl MotionMode {
    pub fn is_arc(&self) -> bool {
        matches!(self, MotionMode::ArcCw | MotionMode::ArcCcw)
    }

    /// G word that selects this mode
    pub fn code(&self) -> String {
        match self {
            MotionMode::Rapid => "G0".into(),
            MotionMode::Linear => "G1".into(),
            MotionMode::ArcCw => "G2".into(),
            MotionMode::ArcCcw => "G3".into(),
            MotionMode::Probe(minor) => format!("G38.{minor}"),
        }
    }
}

/// Plane selection (group 2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Plane {
    #[default]
    XY,
    XZ,
    YZ,
}

/// One tool motion with absolute end points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Move {
    pub motion: MotionMode,
    pub start: Point3,
    pub end: Point3,
    /// Absolute XY arc center, only for arcs in the XY plane
    pub center: Option<[f64; 2]>,
    /// Line was in G91
    pub incremental: bool,
    /// Active feed rate
    pub feed: f64,
}

impl Move {
    /// True when X, Y and Z are known at both ends
    pub fn is_fully_known(&self) -> bool {
        self.start.iter().chain(self.end.iter()).all(Option::is_some)
    }
}

/// Modal state relevant to coordinate tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModalTracker {
    /// `None` after `G80`
    pub motion: Option<MotionMode>,
    pub plane: Plane,
    pub units: Units,
    pub incremental: bool,
    pub feed: f64,
    pub position: Point3,
}

impl Default for ModalTracker {
    fn default() -> Self {
        Self {
            motion: Some(MotionMode::Rapid),
            plane: Plane::XY,
            units: Units::MM,
            incremental: false,
            feed: 0.0,
            position: [None; 3],
        }
    }
}

const AXES: [char; 3] = ['X', 'Y', 'Z'];

impl ModalTracker {
    /// Tracker with all axes unknown
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker starting from a known position
    pub fn at(x: f64, y: f64, z: f64) -> Self {
        Self {
            position: [Some(x), Some(y), Some(z)],
            ..Self::default()
        }
    }

    fn targets(&self, line: &GcodeLine) -> Point3 {
        let mut end = self.position;
        for (i, letter) in AXES.iter().enumerate() {
            if let Some(v) = line.get(*letter) {
                end[i] = if self.incremental {
                    self.position[i].map(|p| p + v)
                } else {
                    Some(v)
                };
            }
        }
        end
    }

    /// Interpret one line, returning its move if it has one
    pub fn apply(&mut self, line: &GcodeLine, line_number: u32) -> Result<Option<Move>, GcodeError> {
        if line.kind() != LineKind::Gcode {
            return Ok(None);
        }

        let mut machine_coords = false;
        let mut axis_consumer = false;
        let mut forget_all = false;
        let mut offset_set = false;

        for value in line.values('G') {
            let major = value.trunc() as u32;
            let minor = ((value - value.trunc()) * 10.0).round() as u32;
            match (major, minor) {
                (0, 0) => self.motion = Some(MotionMode::Rapid),
                (1, 0) => self.motion = Some(MotionMode::Linear),
                (2, 0) => self.motion = Some(MotionMode::ArcCw),
                (3, 0) => self.motion = Some(MotionMode::ArcCcw),
                (38, m @ 2..=5) => self.motion = Some(MotionMode::Probe(m)),
                (80, 0) => self.motion = None,
                (17, 0) => self.plane = Plane::XY,
                (18, 0) => self.plane = Plane::XZ,
                (19, 0) => self.plane = Plane::YZ,
                (20, 0) => self.switch_units(Units::INCH),
                (21, 0) => self.switch_units(Units::MM),
                (90, 0) => self.incremental = false,
                (91, 0) => self.incremental = true,
                (53, 0) => machine_coords = true,
                (28, _) | (30, _) => {
                    axis_consumer = true;
                    forget_all = true;
                }
                (10, 0) => {
                    axis_consumer = true;
                    match line.get('L').map(|l| l as u32) {
                        Some(20) => offset_set = true,
                        _ => forget_all = true,
                    }
                }
                (92, 0) => {
                    axis_consumer = true;
                    offset_set = true;
                }
                (92, _) | (54..=59, _) => forget_all = true,
                (43, 1) | (4, 0) => axis_consumer = true,
                _ => {}
            }
        }
        if let Some(f) = line.get('F') {
            if f < 0.0 {
                return Err(GcodeError::InvalidParameter {
                    line_number,
                    param: "F".into(),
                    reason: "negative feed rate".into(),
                });
            }
            self.feed = f;
        }

        let has_axes = AXES.iter().any(|a| line.has(*a));

        if offset_set {
            // G92 / G10 L20 declare the current position
            for (i, letter) in AXES.iter().enumerate() {
                if let Some(v) = line.get(*letter) {
                    self.position[i] = Some(v);
                }
            }
            return Ok(None);
        }
        if forget_all {
            self.position = [None; 3];
            return Ok(None);
        }
        if axis_consumer || !has_axes {
            return Ok(None);
        }
        if machine_coords {
            for (i, letter) in AXES.iter().enumerate() {
                if line.has(*letter) {
                    self.position[i] = None;
                }
            }
            return Ok(None);
        }

        let Some(motion) = self.motion else {
            return Ok(None);
        };

        let start = self.position;
        let end = self.targets(line);
        let center = if motion.is_arc() && self.plane == Plane::XY {
            self.arc_center(line, start, end, motion, line_number)?
        } else {
            None
        };
        self.position = end;

        Ok(Some(Move {
            motion,
            start,
            end,
            center,
            incremental: self.incremental,
            feed: self.feed,
        }))
    }

    fn switch_units(&mut self, units: Units) {
        if self.units == units {
            return;
        }
        let factor = match units {
            Units::INCH => 1.0 / 25.4,
            Units::MM => 25.4,
        };
        for p in self.position.iter_mut() {
            *p = p.map(|v| v * factor);
        }
        self.units = units;
    }

    fn arc_center(
        &self,
        line: &GcodeLine,
        start: Point3,
        end: Point3,
        motion: MotionMode,
        line_number: u32,
    ) -> Result<Option<[f64; 2]>, GcodeError> {
        let (Some(sx), Some(sy), Some(ex), Some(ey)) = (start[0], start[1], end[0], end[1]) else {
            return Ok(None);
        };

        if let Some(r) = line.get('R') {
            let dx = ex - sx;
            let dy = ey - sy;
            let chord = (dx * dx + dy * dy).sqrt();
            if chord < 1e-9 {
                return Err(GcodeError::InvalidArc {
                    line_number,
                    reason: "R-form arc with coincident end points".into(),
                });
            }
            let half = chord / 2.0;
            if r.abs() < half - 1e-6 {
                return Err(GcodeError::InvalidArc {
                    line_number,
                    reason: format!("radius {r} shorter than half chord {half:.4}"),
                });
            }
            let h = (r * r - half * half).max(0.0).sqrt();
            // Center lies left of the chord for CCW arcs with positive R
            let mut side = if motion == MotionMode::ArcCw { -1.0 } else { 1.0 };
            if r < 0.0 {
                side = -side;
            }
            let mx = sx + dx / 2.0;
            let my = sy + dy / 2.0;
            let cx = mx - side * h * dy / chord;
            let cy = my + side * h * dx / chord;
            return Ok(Some([cx, cy]));
        }

        let i = line.get('I').unwrap_or(0.0);
        let j = line.get('J').unwrap_or(0.0);
        if i == 0.0 && j == 0.0 {
            return Err(GcodeError::InvalidArc {
                line_number,
                reason: "arc without I/J or R".into(),
            });
        }
        Ok(Some([sx + i, sy + j]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(tracker: &mut ModalTracker, text: &str) -> Option<Move> {
        let line = GcodeLine::parse(text, 1).unwrap();
        tracker.apply(&line, 1).unwrap()
    }

    #[test]
    fn test_absolute_and_incremental() {
        let mut t = ModalTracker::at(0.0, 0.0, 0.0);
        let m = run(&mut t, "G1 X10 Y5 F100").unwrap();
        assert_eq!(m.end, [Some(10.0), Some(5.0), Some(0.0)]);
        assert_eq!(m.feed, 100.0);
        run(&mut t, "G91");
        let m = run(&mut t, "X1 Z-2").unwrap();
        assert_eq!(m.end, [Some(11.0), Some(5.0), Some(-2.0)]);
        assert!(m.incremental);
    }

    #[test]
    fn test_unknown_axes() {
        let mut t = ModalTracker::new();
        let m = run(&mut t, "G0 X1 Y2").unwrap();
        assert_eq!(m.end, [Some(1.0), Some(2.0), None]);
        assert!(!m.is_fully_known());
        run(&mut t, "G53 G0 Z-1");
        assert_eq!(t.position, [Some(1.0), Some(2.0), None]);
        run(&mut t, "G28");
        assert_eq!(t.position, [None; 3]);
    }

    #[test]
    fn test_offset_declares_position() {
        let mut t = ModalTracker::new();
        assert!(run(&mut t, "G92 X0 Y0 Z0").is_none());
        assert_eq!(t.position, [Some(0.0); 3]);
        run(&mut t, "G10 L20 P0 Z5");
        assert_eq!(t.position[2], Some(5.0));
    }

    #[test]
    fn test_arc_centers() {
        let mut t = ModalTracker::at(0.0, 0.0, 0.0);
        let m = run(&mut t, "G2 X10 Y0 I5 J0").unwrap();
        assert_eq!(m.center, Some([5.0, 0.0]));

        let mut t = ModalTracker::at(0.0, 0.0, 0.0);
        let m = run(&mut t, "G3 X10 Y0 R5").unwrap();
        let c = m.center.unwrap();
        assert!((c[0] - 5.0).abs() < 1e-9 && c[1].abs() < 1e-9);
    }

    #[test]
    fn test_invalid_arc() {
        let mut t = ModalTracker::at(0.0, 0.0, 0.0);
        let line = GcodeLine::parse("G2 X10 Y0", 3).unwrap();
        assert!(matches!(
            t.apply(&line, 3),
            Err(GcodeError::InvalidArc { line_number: 3, .. })
        ));
    }

    #[test]
    fn test_units_conversion() {
        let mut t = ModalTracker::at(25.4, 0.0, 0.0);
        run(&mut t, "G20");
        assert!((t.position[0].unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_g80_cancels_motion() {
        let mut t = ModalTracker::at(0.0, 0.0, 0.0);
        run(&mut t, "G80");
        assert!(run(&mut t, "X5").is_none());
    }
}
