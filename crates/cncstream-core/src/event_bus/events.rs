//! Event type definitions for the event bus.
//!
//! This module defines all backend events organized by category.
//! Events are designed to be cloneable and serializable for logging/replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::data::{ControllerState, ModalState, Overrides, Position, ProbePoint};

/// Root event enum for all backend events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AppEvent {
    /// Connection lifecycle
    Connection(ConnectionEvent),
    /// Machine state and telemetry
    Machine(MachineEvent),
    /// Serial traffic and flow control
    Serial(SerialEvent),
    /// Program runs and tool changes
    Run(RunEvent),
    /// Autolevel probing
    Autolevel(AutolevelEvent),
    /// Orientation markers and solutions
    Orient(OrientEvent),
    /// Error and diagnostic events
    Error(ErrorEvent),
}

impl AppEvent {
    /// Get the category of this event
    pub fn category(&self) -> EventCategory {
        match self {
            AppEvent::Connection(_) => EventCategory::Connection,
            AppEvent::Machine(_) => EventCategory::Machine,
            AppEvent::Serial(_) => EventCategory::Serial,
            AppEvent::Run(_) => EventCategory::Run,
            AppEvent::Autolevel(_) => EventCategory::Autolevel,
            AppEvent::Orient(_) => EventCategory::Orient,
            AppEvent::Error(_) => EventCategory::Error,
        }
    }

    /// Get a short description of this event for logging
    pub fn description(&self) -> String {
        match self {
            AppEvent::Connection(e) => e.description(),
            AppEvent::Machine(e) => e.description(),
            AppEvent::Serial(e) => e.description(),
            AppEvent::Run(e) => e.description(),
            AppEvent::Autolevel(e) => e.description(),
            AppEvent::Orient(e) => e.description(),
            AppEvent::Error(e) => e.description(),
        }
    }
}

/// Event category for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    Connection,
    Machine,
    Serial,
    Run,
    Autolevel,
    Orient,
    Error,
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventCategory::Connection => write!(f, "Connection"),
            EventCategory::Machine => write!(f, "Machine"),
            EventCategory::Serial => write!(f, "Serial"),
            EventCategory::Run => write!(f, "Run"),
            EventCategory::Autolevel => write!(f, "Autolevel"),
            EventCategory::Orient => write!(f, "Orient"),
            EventCategory::Error => write!(f, "Error"),
        }
    }
}

/// Reason for disconnection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// User requested disconnect
    UserRequested,
    /// Transport read or write failed
    ConnectionLost(String),
}

/// Connection-related events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// Starting connection attempt.
    Connecting {
        /// Port being opened.
        port: String,
    },
    /// Transport open and firmware answered.
    Connected {
        /// Port that was opened.
        port: String,
        /// Firmware identification, empty if no banner was seen.
        firmware: String,
    },
    /// Transport closed.
    Disconnected {
        /// Port that was closed.
        port: String,
        /// Why the connection ended.
        reason: DisconnectReason,
    },
    /// Connection attempt failed.
    ConnectionFailed {
        /// Port that failed.
        port: String,
        /// Error message describing the failure.
        error: String,
    },
    /// Firmware printed its startup banner (after power-up or soft reset).
    FirmwareReset {
        /// Banner text, e.g. `Grbl 1.1h ['$' for help]`.
        banner: String,
    },
}

impl ConnectionEvent {
    fn description(&self) -> String {
        match self {
            ConnectionEvent::Connecting { port } => format!("Connecting to {}", port),
            ConnectionEvent::Connected { port, firmware } => {
                format!("Connected to {} ({})", port, firmware)
            }
            ConnectionEvent::Disconnected { port, reason } => {
                format!("Disconnected from {}: {:?}", port, reason)
            }
            ConnectionEvent::ConnectionFailed { port, error } => {
                format!("Connection failed to {}: {}", port, error)
            }
            ConnectionEvent::FirmwareReset { banner } => format!("Firmware reset: {}", banner),
        }
    }
}

/// Machine state and telemetry events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MachineEvent {
    /// Controller state changed according to a status report.
    StateChanged {
        old: ControllerState,
        new: ControllerState,
    },
    /// New positions from a status report.
    PositionUpdated {
        machine: Position,
        work: Position,
    },
    /// Override percentages changed.
    OverridesChanged(Overrides),
    /// Probe cycle completed (`[PRB:...]`).
    ProbeUpdated(ProbePoint),
    /// Parser modal state reported (`[GC:...]`).
    ParserStateUpdated(ModalState),
    /// Tool length offset reported or computed.
    ToolOffsetUpdated {
        tlo: f64,
    },
    /// Firmware raised an alarm.
    AlarmTriggered {
        code: u8,
        message: String,
    },
    /// Alarm lock cleared by an acknowledged unlock or homing command.
    AlarmCleared,
    /// Free-form `[MSG:...]` from firmware.
    FirmwareMessage {
        text: String,
    },
    /// A state key was refreshed and observers should re-read it.
    GenericUpdate {
        key: String,
    },
}

impl MachineEvent {
    fn description(&self) -> String {
        match self {
            MachineEvent::StateChanged { old, new } => format!("State: {} -> {}", old, new),
            MachineEvent::PositionUpdated { machine, work } => {
                format!("MPos {} WPos {}", machine, work)
            }
            MachineEvent::OverridesChanged(ov) => format!(
                "Overrides feed {}% rapid {}% spindle {}%",
                ov.feed, ov.rapid, ov.spindle
            ),
            MachineEvent::ProbeUpdated(p) => {
                format!("Probe {} (contact: {})", p.position, p.success)
            }
            MachineEvent::ParserStateUpdated(modal) => {
                format!("Parser state {} {} {}", modal.motion, modal.wcs, modal.plane)
            }
            MachineEvent::ToolOffsetUpdated { tlo } => format!("TLO {:.3}", tlo),
            MachineEvent::AlarmTriggered { code, message } => {
                format!("ALARM:{} {}", code, message)
            }
            MachineEvent::AlarmCleared => "Alarm cleared".to_string(),
            MachineEvent::FirmwareMessage { text } => format!("MSG: {}", text),
            MachineEvent::GenericUpdate { key } => format!("Updated {}", key),
        }
    }
}

/// Serial traffic events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SerialEvent {
    /// Line written to the transport.
    Sent { line: String },
    /// Raw line received that is not an acknowledgment.
    Received { line: String },
    /// `ok` matched to the oldest in-flight line.
    Acknowledged { line: String },
    /// `error:N` matched to the oldest in-flight line.
    Rejected { line: String, code: u8, message: String },
    /// Realtime byte written outside the queue.
    Realtime { byte: u8 },
    /// Receive buffer usage after a send or acknowledgment.
    BufferFill { used: usize, capacity: usize, percent: f64 },
    /// Outbound queue was cleared.
    QueueCleared { dropped: usize },
}

impl SerialEvent {
    fn description(&self) -> String {
        match self {
            SerialEvent::Sent { line } => format!("> {}", line),
            SerialEvent::Received { line } => format!("< {}", line),
            SerialEvent::Acknowledged { line } => format!("ok: {}", line),
            SerialEvent::Rejected { line, code, message } => {
                format!("error:{} ({}) for {}", code, message, line)
            }
            SerialEvent::Realtime { byte } => format!("realtime 0x{:02X}", byte),
            SerialEvent::BufferFill { percent, .. } => format!("Buffer {:.0}%", percent),
            SerialEvent::QueueCleared { dropped } => format!("Queue cleared ({} lines)", dropped),
        }
    }
}

/// How a run finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// Last line acknowledged and controller back to Idle
    Completed,
    /// Stopped by the operator
    Stopped,
    /// Aborted by a transport failure
    Failed(String),
}

/// Run controller events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RunEvent {
    /// Run accepted.
    Started {
        total: usize,
        at: DateTime<Utc>,
    },
    /// A run line was acknowledged.
    Progress { completed: usize, total: usize },
    /// `%msg` directive reached.
    Message { text: String },
    /// Submission suspended until the operator confirms the tool change.
    ToolChangePending { tool: u32, token: u64 },
    /// Operator confirmed; submission resumes.
    ToolChangeAcknowledged { tool: u32, token: u64 },
    /// Run finished.
    Ended {
        outcome: RunOutcome,
        lines: usize,
        elapsed: Duration,
    },
}

impl RunEvent {
    fn description(&self) -> String {
        match self {
            RunEvent::Started { total, .. } => format!("Run started ({} lines)", total),
            RunEvent::Progress { completed, total } => format!("Run {}/{}", completed, total),
            RunEvent::Message { text } => text.clone(),
            RunEvent::ToolChangePending { tool, .. } => format!("Tool change T{:02}", tool),
            RunEvent::ToolChangeAcknowledged { tool, .. } => format!("Tool T{:02} loaded", tool),
            RunEvent::Ended {
                outcome,
                lines,
                elapsed,
            } => format!(
                "Run ended {:?} after {} lines in {:.1}s",
                outcome,
                lines,
                elapsed.as_secs_f64()
            ),
        }
    }
}

/// Autolevel scan events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AutolevelEvent {
    ScanStarted { total: usize },
    PointProbed {
        point: ProbePoint,
        completed: usize,
        total: usize,
    },
    PointFailed { x: f64, y: f64 },
    ScanCompleted { failed: usize },
    /// Scan stopped before the last point; partial grid discarded.
    ScanAborted { completed: usize, total: usize },
}

impl AutolevelEvent {
    fn description(&self) -> String {
        match self {
            AutolevelEvent::ScanStarted { total } => format!("Scan started ({} points)", total),
            AutolevelEvent::PointProbed {
                completed, total, ..
            } => format!("Probed {}/{}", completed, total),
            AutolevelEvent::PointFailed { x, y } => format!("No contact at {:.3},{:.3}", x, y),
            AutolevelEvent::ScanCompleted { failed } => {
                format!("Scan completed ({} failed points)", failed)
            }
            AutolevelEvent::ScanAborted { completed, total } => {
                format!("Scan aborted at {}/{}", completed, total)
            }
        }
    }
}

/// Orientation events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrientEvent {
    /// Marker set edited; any previous solution is stale.
    MarkersChanged { count: usize },
    Solved {
        angle_deg: f64,
        dx: f64,
        dy: f64,
        max_error: f64,
    },
}

impl OrientEvent {
    fn description(&self) -> String {
        match self {
            OrientEvent::MarkersChanged { count } => format!("{} markers", count),
            OrientEvent::Solved {
                angle_deg,
                dx,
                dy,
                max_error,
            } => format!(
                "Orientation {:.3} deg offset {:.3},{:.3} (max error {:.4})",
                angle_deg, dx, dy, max_error
            ),
        }
    }
}

/// Error and diagnostic events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ErrorEvent {
    /// Malformed or unexpected firmware response, skipped.
    Protocol { message: String },
    /// Directive or substitution failed at send time.
    Directive { line: String, message: String },
    /// Height map lookups fell back to neighbors.
    DegradedAccuracy { failed_points: usize },
}

impl ErrorEvent {
    fn description(&self) -> String {
        match self {
            ErrorEvent::Protocol { message } => format!("Protocol error: {}", message),
            ErrorEvent::Directive { line, message } => format!("{}: {}", line, message),
            ErrorEvent::DegradedAccuracy { failed_points } => {
                format!("{} probe points interpolated from neighbors", failed_points)
            }
        }
    }
}
