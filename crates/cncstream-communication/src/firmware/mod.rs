//! Firmware protocol support
//!
//! Only GRBL 1.1 is spoken. The [`grbl`] module holds the response
//! parsers, realtime command bytes, error tables and the protocol engine.

pub mod grbl;

pub use grbl::{
    EngineConfig, GrblResponse, GrblResponseParser, ProtocolEngine, RealtimeCommand,
    StatusParser, StatusReport,
};
