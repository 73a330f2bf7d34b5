//! Data models for positions, controller status and probe results
//!
//! This module provides:
//! - 6-axis position tracking (X, Y, Z, A, B, C)
//! - Controller state as reported by GRBL-family firmware
//! - Override percentages and planner buffer availability
//! - Probe records and program bounds

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine coordinate units (millimeters or inches)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Units {
    /// Millimeters (G21)
    #[default]
    MM,
    /// Inches (G20)
    INCH,
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Units::MM => write!(f, "mm"),
            Units::INCH => write!(f, "in"),
        }
    }
}

/// Machine axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
    A,
    B,
    C,
}

impl Axis {
    /// All axes in report order
    pub const ALL: [Axis; 6] = [Axis::X, Axis::Y, Axis::Z, Axis::A, Axis::B, Axis::C];

    /// Lowercase letter used in state key names (`wx`, `mz`, ...)
    pub fn letter(self) -> char {
        match self {
            Axis::X => 'x',
            Axis::Y => 'y',
            Axis::Z => 'z',
            Axis::A => 'a',
            Axis::B => 'b',
            Axis::C => 'c',
        }
    }

    /// Parse a lowercase or uppercase axis letter
    pub fn from_letter(c: char) -> Option<Self> {
        match c.to_ascii_lowercase() {
            'x' => Some(Axis::X),
            'y' => Some(Axis::Y),
            'z' => Some(Axis::Z),
            'a' => Some(Axis::A),
            'b' => Some(Axis::B),
            'c' => Some(Axis::C),
            _ => None,
        }
    }
}

/// 6-axis coordinate
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl Position {
    /// Create a position with X, Y, Z set and rotary axes at zero
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        debug_assert!(
            x.is_finite() && y.is_finite() && z.is_finite(),
            "Position axes must be finite: x={x}, y={y}, z={z}"
        );
        Self {
            x,
            y,
            z,
            ..Default::default()
        }
    }

    /// Build a position from a comma-separated axis list (missing axes are zero)
    pub fn from_axes(values: &[f64]) -> Self {
        let mut pos = Self::default();
        for (axis, value) in Axis::ALL.iter().zip(values) {
            pos.set(*axis, *value);
        }
        pos
    }

    /// Read one axis
    pub fn get(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
            Axis::A => self.a,
            Axis::B => self.b,
            Axis::C => self.c,
        }
    }

    /// Write one axis
    pub fn set(&mut self, axis: Axis, value: f64) {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
            Axis::Z => self.z = value,
            Axis::A => self.a = value,
            Axis::B => self.b = value,
            Axis::C => self.c = value,
        }
    }

    /// Component-wise sum
    pub fn add(&self, other: &Position) -> Self {
        let mut out = *self;
        for axis in Axis::ALL {
            out.set(axis, self.get(axis) + other.get(axis));
        }
        out
    }

    /// Component-wise difference
    pub fn subtract(&self, other: &Position) -> Self {
        let mut out = *self;
        for axis in Axis::ALL {
            out.set(axis, self.get(axis) - other.get(axis));
        }
        out
    }

    /// Copy with every axis past the first `count` at zero
    pub fn limited_to(&self, count: usize) -> Self {
        let mut out = *self;
        for axis in Axis::ALL.iter().skip(count) {
            out.set(*axis, 0.0);
        }
        out
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X:{:.3} Y:{:.3} Z:{:.3}", self.x, self.y, self.z)
    }
}

/// Controller state machine states
///
/// Mirrors the state field of GRBL status reports. Apart from
/// `Disconnected` (transport loss) and `Unknown` (connected, no status report
/// yet) every value comes straight from the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ControllerState {
    /// Not connected to any controller
    #[default]
    Disconnected,
    /// Connected, awaiting the first status report
    Unknown,
    /// Ready for commands
    Idle,
    /// Executing motion
    Run,
    /// Feed hold active
    Hold,
    /// Jog motion
    Jog,
    /// Alarm lock, requires unlock or homing
    Alarm,
    /// Safety door open
    Door,
    /// Check mode (dry run)
    Check,
    /// Homing cycle in progress
    Home,
    /// Sleep mode
    Sleep,
}

impl ControllerState {
    /// Parse the state word of a status report (`Hold:0` parses as `Hold`)
    pub fn from_grbl(word: &str) -> Option<Self> {
        let name = word.split(':').next().unwrap_or(word);
        match name {
            "Idle" => Some(Self::Idle),
            "Run" => Some(Self::Run),
            "Hold" => Some(Self::Hold),
            "Jog" => Some(Self::Jog),
            "Alarm" => Some(Self::Alarm),
            "Door" => Some(Self::Door),
            "Check" => Some(Self::Check),
            "Home" => Some(Self::Home),
            "Sleep" => Some(Self::Sleep),
            _ => None,
        }
    }

    /// Check if this state indicates the controller is connected
    pub fn is_connected(&self) -> bool {
        !matches!(self, ControllerState::Disconnected)
    }

    /// Motion has finished and the planner is empty
    pub fn is_quiescent(&self) -> bool {
        matches!(self, ControllerState::Idle | ControllerState::Check)
    }

    /// Check if this state indicates active motion
    pub fn is_moving(&self) -> bool {
        matches!(
            self,
            ControllerState::Run | ControllerState::Jog | ControllerState::Home
        )
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "Disconnected",
            Self::Unknown => "Unknown",
            Self::Idle => "Idle",
            Self::Run => "Run",
            Self::Hold => "Hold",
            Self::Jog => "Jog",
            Self::Alarm => "Alarm",
            Self::Door => "Door",
            Self::Check => "Check",
            Self::Home => "Home",
            Self::Sleep => "Sleep",
        };
        f.write_str(name)
    }
}

/// Feed, rapid and spindle override percentages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overrides {
    pub feed: u16,
    pub rapid: u16,
    pub spindle: u16,
}

impl Default for Overrides {
    fn default() -> Self {
        Self {
            feed: 100,
            rapid: 100,
            spindle: 100,
        }
    }
}

/// Planner blocks and receive-buffer bytes available (`Bf:` field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BufferState {
    pub planner_blocks: u16,
    pub rx_bytes: u16,
}

/// Result of a single probing move
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbePoint {
    /// Axis coordinates where the probe triggered (or stopped)
    pub position: Position,
    /// Requested target of the probing move
    pub target: Position,
    /// Contact was made before the target was reached
    pub success: bool,
}

impl ProbePoint {
    /// Failed point at the given target
    pub fn failed(target: Position) -> Self {
        Self {
            position: target,
            target,
            success: false,
        }
    }
}

/// Axis-aligned bounding box of a motion program
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: Position,
    pub max: Position,
}

impl Bounds {
    /// Box containing a single point
    pub fn at(point: Position) -> Self {
        Self {
            min: point,
            max: point,
        }
    }

    /// Grow the box to include `point` (XYZ only)
    pub fn include(&mut self, point: &Position) {
        self.min.x = self.min.x.min(point.x);
        self.min.y = self.min.y.min(point.y);
        self.min.z = self.min.z.min(point.z);
        self.max.x = self.max.x.max(point.x);
        self.max.y = self.max.y.max(point.y);
        self.max.z = self.max.z.max(point.z);
    }

    /// Box width along X
    pub fn width(&self) -> f64 {
        self.max.x - self.min.x
    }

    /// Box height along Y
    pub fn height(&self) -> f64 {
        self.max.y - self.min.y
    }
}

/// Parser modal state reported by `$G`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModalState {
    /// Motion mode word (`G0`, `G1`, ...)
    pub motion: String,
    /// Active work coordinate system (`G54`..`G59`)
    pub wcs: String,
    /// Plane selection
    pub plane: String,
    pub units: Units,
    /// Absolute (`G90`) when false
    pub incremental: bool,
    /// Feed rate mode word
    pub feed_mode: String,
    /// Spindle word (`M3`, `M4`, `M5`)
    pub spindle: String,
    /// Coolant word (`M7`, `M8`, `M9`)
    pub coolant: String,
    pub tool: u32,
    pub feed: f64,
    pub spindle_speed: f64,
}

impl Default for ModalState {
    fn default() -> Self {
        Self {
            motion: "G0".to_string(),
            wcs: "G54".to_string(),
            plane: "G17".to_string(),
            units: Units::MM,
            incremental: false,
            feed_mode: "G94".to_string(),
            spindle: "M5".to_string(),
            coolant: "M9".to_string(),
            tool: 0,
            feed: 0.0,
            spindle_speed: 0.0,
        }
    }
}
