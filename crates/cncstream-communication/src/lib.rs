//! # cncstream Communication
//!
//! Transports, the GRBL protocol engine and the run controller.
//! The [`CncController`] facade ties them together on a dedicated I/O thread.

pub mod communication;
pub mod controller;
pub mod firmware;
pub mod queue;
pub mod run;

pub use communication::{
    list_ports, FlowControl, SerialPortInfo, SerialTransport, SimulatedGrbl, Transport,
    TransportParams,
};
pub use controller::CncController;
pub use firmware::grbl::{
    decode_alarm, decode_error, override_sequence, EngineConfig, GrblResponse,
    GrblResponseParser, OverrideChannel, ProtocolEngine, RealtimeCommand, StatusParser,
    StatusReport,
};
pub use queue::{ControlRequest, LineTemplate, QueueHandles, QueueItem, QueueItemKind, Suspension};
pub use run::{RunController, RunSettings, Step};
