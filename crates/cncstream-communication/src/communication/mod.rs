//! Byte transports to the controller
//!
//! The protocol engine talks to firmware through the [`Transport`] trait.
//! Reads are blocking with a short timeout so the owning thread can
//! interleave sending with receiving.

pub mod flow_control;
pub mod serial;
pub mod simulator;

use std::io;
use std::time::Duration;

use cncstream_core::ConnectionError;
use cncstream_settings::ConnectionSettings;

pub use flow_control::{FlowControl, InFlight};
pub use serial::{list_ports, SerialPortInfo, SerialTransport};
pub use simulator::SimulatedGrbl;

/// Parameters used to open a transport
#[derive(Debug, Clone, PartialEq)]
pub struct TransportParams {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Upper bound for a single blocking read
    pub read_timeout: Duration,
}

impl TransportParams {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            read_timeout: Duration::from_millis(20),
        }
    }

    /// Set the read timeout
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Parameters from the connection settings section
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self::new(settings.port.clone(), settings.baud_rate)
            .with_read_timeout(Duration::from_millis(settings.read_timeout_ms))
    }
}

impl Default for TransportParams {
    fn default() -> Self {
        Self::new("", 115200)
    }
}

/// Byte stream to a motion controller
///
/// `read` returns `Ok(0)` or an error of kind `TimedOut`/`WouldBlock` when
/// nothing arrived within the read timeout; any other error means the
/// transport is gone.
pub trait Transport: Send {
    /// Open the transport
    fn open(&mut self, params: &TransportParams) -> Result<(), ConnectionError>;

    /// Read available bytes, waiting at most the read timeout
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all bytes
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flush pending output
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Close the transport; further reads and writes fail
    fn close(&mut self);

    /// Check if the transport is open
    fn is_open(&self) -> bool;

    /// Human readable name of the endpoint
    fn name(&self) -> String;
}

/// True for read errors that only mean "no data yet"
pub fn is_idle_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
