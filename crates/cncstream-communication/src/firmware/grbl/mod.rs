//! GRBL 1.1 protocol
//!
//! - Response and status report parsing
//! - Realtime command bytes and override stepping
//! - Error and alarm code tables
//! - The protocol engine that streams lines under character counting

pub mod engine;
pub mod error_decoder;
pub mod realtime;
pub mod response_parser;
pub mod status_parser;

pub use engine::{EngineConfig, ProtocolEngine};
pub use error_decoder::{alarm_description, decode_alarm, decode_error, error_description};
pub use realtime::{override_sequence, OverrideChannel, RealtimeCommand};
pub use response_parser::{GrblResponse, GrblResponseParser};
pub use status_parser::{StatusParser, StatusReport};
