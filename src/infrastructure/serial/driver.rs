use crate::domain::error::{SerialFault, SerialFaultKind};
use serialport::SerialPort;
use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// An open serial device the link can drain.
pub trait SerialStream: Send {
    /// Number of bytes buffered by the OS and not yet read.
    fn bytes_available(&self) -> io::Result<u32>;

    /// Read up to `buf.len()` bytes.
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Opens serial devices in two steps, mirroring how the link recovers:
/// `construct` resolves the device identifier into a usable handle, `open`
/// acquires the device itself.
pub trait SerialDriver: Send + 'static {
    type Stream: SerialStream + 'static;

    fn construct(&mut self, device: &str, baud_rate: u32) -> Result<(), SerialFault>;

    fn open(&mut self, device: &str, baud_rate: u32) -> Result<Self::Stream, SerialFault>;
}

/// Driver backed by the OS serial stack through the `serialport` crate.
#[derive(Debug, Clone)]
pub struct NativeDriver {
    read_timeout: Duration,
}

impl NativeDriver {
    pub fn new() -> Self {
        Self {
            read_timeout: Duration::from_millis(100),
        }
    }
}

impl Default for NativeDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialDriver for NativeDriver {
    type Stream = Box<dyn SerialPort>;

    fn construct(&mut self, device: &str, _baud_rate: u32) -> Result<(), SerialFault> {
        if device.trim().is_empty() {
            return Err(SerialFault::new(
                SerialFaultKind::Invalid,
                "device identifier is empty",
            ));
        }

        // Device nodes (including ptys and udev symlinks) resolve directly.
        if Path::new(device).exists() {
            return Ok(());
        }

        match serialport::available_ports() {
            Ok(ports) if ports.iter().any(|p| p.port_name == device) => Ok(()),
            Ok(ports) => {
                debug!(device, visible = ports.len(), "Serial device not enumerated");
                Err(SerialFault::new(
                    SerialFaultKind::NotFound,
                    format!("{} is not present", device),
                ))
            }
            Err(e) => Err(SerialFault::new(
                SerialFaultKind::NotFound,
                format!("failed to enumerate serial ports: {}", e),
            )),
        }
    }

    fn open(&mut self, device: &str, baud_rate: u32) -> Result<Self::Stream, SerialFault> {
        serialport::new(device, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None)
            .timeout(self.read_timeout)
            .open()
            .map_err(|e| classify_open_error(e, Path::new(device).exists()))
    }
}

/// Classify a failed open. On posix, serialport reports a port held
/// exclusively by another process (EBUSY from TIOCEXCL) as `NoDevice`; while
/// the device node still exists that is a busy port, not a missing one.
fn classify_open_error(error: serialport::Error, device_present: bool) -> SerialFault {
    let mut fault = SerialFault::from(error);
    if fault.kind == SerialFaultKind::NotFound && device_present {
        fault.kind = SerialFaultKind::Busy;
    }
    fault
}

impl SerialStream for Box<dyn SerialPort> {
    fn bytes_available(&self) -> io::Result<u32> {
        self.bytes_to_read().map_err(io::Error::from)
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut **self, buf)
    }
}

/// List the serial devices the OS currently reports.
pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>, serialport::Error> {
    serialport::available_ports()
}
