//! Serial port transport
//!
//! Provides port enumeration and the [`SerialTransport`] used for direct
//! hardware connection to GRBL controllers via USB or RS-232.

use std::io::{self, Read, Write};

use cncstream_core::{ConnectionError, Error, Result};

use super::{Transport, TransportParams};

/// Port name that selects the first available CNC port
pub const AUTO_PORT: &str = "Auto";

/// An enumerated serial port
#[derive(Debug, Clone, PartialEq)]
pub struct SerialPortInfo {
    /// Device path or COM name
    pub port_name: String,
    pub description: String,
    pub manufacturer: Option<String>,
    pub serial_number: Option<String>,
    /// USB vendor and product IDs
    pub usb_ids: Option<(u16, u16)>,
}

impl SerialPortInfo {
    fn from_serialport(port: &serialport::SerialPortInfo) -> Self {
        let mut info = Self {
            port_name: port.port_name.clone(),
            description: "Serial Port".to_string(),
            manufacturer: None,
            serial_number: None,
            usb_ids: None,
        };
        match &port.port_type {
            serialport::SerialPortType::UsbPort(usb) => {
                info.description = format!(
                    "USB {} {}",
                    usb.manufacturer.as_deref().unwrap_or("Device"),
                    usb.product.as_deref().unwrap_or("Serial Port")
                );
                info.manufacturer = usb.manufacturer.clone();
                info.serial_number = usb.serial_number.clone();
                info.usb_ids = Some((usb.vid, usb.pid));
            }
            serialport::SerialPortType::BluetoothPort => info.description = "Bluetooth Serial".into(),
            serialport::SerialPortType::PciPort => info.description = "PCI Serial".into(),
            _ => {}
        }
        info
    }
}

/// Serial ports a GRBL board can appear on
///
/// `COMn` on Windows, USB CDC/FTDI devices on Linux and macOS.
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = serialport::available_ports().map_err(|e| {
        tracing::error!("Failed to enumerate serial ports: {}", e);
        Error::other(format!("Failed to enumerate ports: {}", e))
    })?;
    Ok(ports
        .iter()
        .filter(|port| is_controller_port(&port.port_name))
        .map(SerialPortInfo::from_serialport)
        .collect())
}

fn is_controller_port(name: &str) -> bool {
    if let Some(number) = name.strip_prefix("COM") {
        return !number.is_empty() && number.chars().all(|c| c.is_ascii_digit());
    }
    ["/dev/ttyUSB", "/dev/ttyACM", "/dev/cu.usbserial-", "/dev/cu.usbmodem"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// Serial transport using the `serialport` crate (8N1, no flow control)
#[derive(Default)]
pub struct SerialTransport {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
}

impl SerialTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn resolve_port(requested: &str) -> std::result::Result<String, ConnectionError> {
        if !requested.is_empty() && requested != AUTO_PORT {
            return Ok(requested.to_string());
        }
        let ports = list_ports().map_err(|e| ConnectionError::PortNotFound {
            port: format!("{} ({})", AUTO_PORT, e),
        })?;
        ports
            .into_iter()
            .next()
            .map(|p| p.port_name)
            .ok_or_else(|| ConnectionError::PortNotFound {
                port: AUTO_PORT.to_string(),
            })
    }

    fn port_mut(&mut self) -> io::Result<&mut Box<dyn serialport::SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port closed"))
    }
}

impl Transport for SerialTransport {
    fn open(&mut self, params: &TransportParams) -> std::result::Result<(), ConnectionError> {
        if params.baud_rate == 0 {
            return Err(ConnectionError::InvalidParameters {
                reason: "baud rate must be positive".into(),
            });
        }
        let port_name = Self::resolve_port(&params.port)?;

        let builder = serialport::new(&port_name, params.baud_rate)
            .timeout(params.read_timeout)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None);

        match builder.open() {
            Ok(port) => {
                tracing::info!("Opened {} at {} baud", port_name, params.baud_rate);
                self.port = Some(port);
                self.name = port_name;
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Failed to open serial port {}: {}", port_name, e);
                Err(match e.kind() {
                    serialport::ErrorKind::NoDevice => ConnectionError::PortNotFound {
                        port: port_name,
                    },
                    _ => ConnectionError::FailedToOpen {
                        port: port_name,
                        reason: e.to_string(),
                    },
                })
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port_mut()?.read(buf)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port_mut()?.write_all(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port_mut()?.flush()
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            tracing::info!("Closed {}", self.name);
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_port_names() {
        assert!(is_controller_port("COM3"));
        assert!(is_controller_port("/dev/ttyUSB0"));
        assert!(is_controller_port("/dev/ttyACM1"));
        assert!(is_controller_port("/dev/cu.usbmodem14101"));
        assert!(!is_controller_port("COM"));
        assert!(!is_controller_port("COMx"));
        assert!(!is_controller_port("/dev/ttyS0"));
    }

    #[test]
    fn test_usb_port_info() {
        let port = serialport::SerialPortInfo {
            port_name: "/dev/ttyACM0".into(),
            port_type: serialport::SerialPortType::UsbPort(serialport::UsbPortInfo {
                vid: 0x2341,
                pid: 0x0043,
                serial_number: Some("7543".into()),
                manufacturer: Some("Arduino".into()),
                product: None,
            }),
        };
        let info = SerialPortInfo::from_serialport(&port);
        assert_eq!(info.description, "USB Arduino Serial Port");
        assert_eq!(info.usb_ids, Some((0x2341, 0x0043)));
        assert_eq!(info.serial_number.as_deref(), Some("7543"));
    }

    #[test]
    fn test_closed_transport_io_fails() {
        let mut transport = SerialTransport::new();
        let mut buf = [0u8; 8];
        assert!(!transport.is_open());
        assert_eq!(
            transport.read(&mut buf).map_err(|e| e.kind()),
            Err(io::ErrorKind::NotConnected)
        );
        assert!(transport.write_all(b"?").is_err());
    }

    #[test]
    fn test_zero_baud_rejected() {
        let mut transport = SerialTransport::new();
        let params = TransportParams::new("/dev/ttyUSB9", 0);
        assert!(matches!(
            transport.open(&params),
            Err(ConnectionError::InvalidParameters { .. })
        ));
    }
}
