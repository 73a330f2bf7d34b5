//! Error handling for cncstream
//!
//! Provides error types for the streaming backend:
//! - Connection errors (transport and handshake)
//! - Protocol errors (unparseable or unexpected firmware responses)
//! - Command rejections (firmware `error:N` for a specific line)
//! - Run errors (run controller preconditions and directives)
//! - State errors (machine state key access)
//! - G-Code errors (line parsing)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

use crate::expr::ExprError;

/// Connection error type
///
/// Fatal to the connect attempt that raised it. Never retried automatically.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// Port not found
    #[error("Port not found: {port}")]
    PortNotFound {
        /// The name of the port that was not found.
        port: String,
    },

    /// Failed to open port
    #[error("Failed to open port {port}: {reason}")]
    FailedToOpen {
        /// The name of the port that failed to open.
        port: String,
        /// The reason the port failed to open.
        reason: String,
    },

    /// The firmware never answered the wake-up sequence
    #[error("No response from controller within {timeout_ms}ms")]
    HandshakeTimeout {
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// Connection lost
    #[error("Connection lost: {reason}")]
    ConnectionLost {
        /// The reason the connection was lost.
        reason: String,
    },

    /// Operation requires an open connection
    #[error("Controller not connected")]
    NotConnected,

    /// Controller is already connected
    #[error("Controller already connected")]
    AlreadyConnected,

    /// Writing to the transport failed
    #[error("Write failed: {reason}")]
    WriteFailed {
        /// The reason the write failed.
        reason: String,
    },

    /// Invalid connection parameters
    #[error("Invalid connection parameters: {reason}")]
    InvalidParameters {
        /// The reason the parameters are invalid.
        reason: String,
    },
}

/// Protocol error type
///
/// Logged and skipped by the protocol engine; never stops the queue.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// A response line could not be parsed
    #[error("Malformed response '{line}': {reason}")]
    MalformedResponse {
        /// The raw response line.
        line: String,
        /// What was wrong with it.
        reason: String,
    },

    /// An acknowledgment arrived with nothing in flight
    #[error("Unexpected response '{line}' with no command in flight")]
    UnexpectedResponse {
        /// The raw response line.
        line: String,
    },

    /// A line cannot ever fit in the controller receive buffer
    #[error("Line of {length} bytes exceeds receive buffer of {capacity} bytes: {line}")]
    LineTooLong {
        /// The offending line.
        line: String,
        /// Line length including terminator.
        length: usize,
        /// Configured buffer capacity.
        capacity: usize,
    },
}

/// Firmware rejected a specific line with an error code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Command '{line}' rejected with error {code}: {message}")]
pub struct CommandRejected {
    /// The line as transmitted.
    pub line: String,
    /// The firmware error code.
    pub code: u8,
    /// Decoded description of the code.
    pub message: String,
}

/// Run controller error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunError {
    /// No controller connection
    #[error("Cannot start run: controller not connected")]
    NotConnected,

    /// A run is already in progress
    #[error("A run is already active")]
    AlreadyRunning,

    /// There is no active run to act on
    #[error("No active run")]
    NotRunning,

    /// A `%` directive could not be understood
    #[error("Invalid directive at line {index}: {directive}")]
    InvalidDirective {
        /// Zero-based index of the line in the submitted program.
        index: usize,
        /// The directive text.
        directive: String,
    },

    /// Expression inside a directive or substitution failed to parse
    #[error("Invalid expression at line {index}: {source}")]
    InvalidExpression {
        /// Zero-based index of the line in the submitted program.
        index: usize,
        /// The parse failure.
        source: ExprError,
    },

    /// Acknowledgment token does not match the pending tool change
    #[error("Tool change token {token} is not pending")]
    StaleToolChangeToken {
        /// The token that was presented.
        token: u64,
    },

    /// Probing request that cannot be turned into a move
    #[error("Invalid probe request: {reason}")]
    InvalidProbe {
        /// What is wrong with the request.
        reason: String,
    },

    /// No probe result has been reported yet
    #[error("No probe position recorded")]
    NoProbeRecord,
}

/// Machine state access error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// Telemetry keys are owned by firmware reports
    #[error("State key '{key}' is read-only")]
    ReadOnlyKey {
        /// The key name.
        key: String,
    },

    /// The key is not known
    #[error("Unknown state key '{key}'")]
    UnknownKey {
        /// The key name.
        key: String,
    },

    /// A value of the wrong type was written
    #[error("State key '{key}' expects a {expected} value")]
    TypeMismatch {
        /// The key name.
        key: String,
        /// Expected value kind.
        expected: &'static str,
    },
}

/// G-Code error type
///
/// Represents errors related to G-Code parsing and program editing.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GcodeError {
    /// Invalid G-Code syntax
    #[error("Invalid syntax at line {line_number}: {reason}")]
    InvalidSyntax {
        /// The line number where the syntax error occurred.
        line_number: u32,
        /// The reason for the syntax error.
        reason: String,
    },

    /// Invalid parameter value
    #[error("Invalid parameter '{param}' at line {line_number}: {reason}")]
    InvalidParameter {
        /// The line number where the invalid parameter was found.
        line_number: u32,
        /// The parameter name.
        param: String,
        /// The reason the parameter is invalid.
        reason: String,
    },

    /// Block index outside the program
    #[error("Block {index} out of range (program has {len} blocks)")]
    BlockOutOfRange {
        /// The requested index.
        index: usize,
        /// Number of blocks in the program.
        len: usize,
    },

    /// Arc without a usable radius or center
    #[error("Invalid arc at line {line_number}: {reason}")]
    InvalidArc {
        /// The line number of the arc.
        line_number: u32,
        /// The reason the arc cannot be interpreted.
        reason: String,
    },
}

/// Main error type for cncstream
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Protocol error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Firmware rejected a command
    #[error(transparent)]
    CommandRejected(#[from] CommandRejected),

    /// Run controller error
    #[error(transparent)]
    Run(#[from] RunError),

    /// Machine state error
    #[error(transparent)]
    State(#[from] StateError),

    /// G-Code error
    #[error(transparent)]
    Gcode(#[from] GcodeError),

    /// Expression error
    #[error(transparent)]
    Expr(#[from] ExprError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Connection(ConnectionError::HandshakeTimeout { .. })
        )
    }

    /// Check if this is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Check if this is a G-Code error
    pub fn is_gcode_error(&self) -> bool {
        matches!(self, Error::Gcode(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::FailedToOpen {
            port: "/dev/ttyUSB0".to_string(),
            reason: "permission denied".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to open port /dev/ttyUSB0: permission denied"
        );
    }

    #[test]
    fn test_command_rejected_display() {
        let err = CommandRejected {
            line: "G5".to_string(),
            code: 20,
            message: "Unsupported or invalid g-code command".to_string(),
        };
        assert!(err.to_string().contains("error 20"));
    }

    #[test]
    fn test_unified_conversion() {
        let err: Error = ConnectionError::HandshakeTimeout { timeout_ms: 500 }.into();
        assert!(err.is_timeout());
        assert!(err.is_connection_error());

        let err: Error = RunError::AlreadyRunning.into();
        assert!(!err.is_connection_error());
    }
}
