//! [`NativeSerial`] – a [`SerialDevice`] backed by the `serialport` crate.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use serialport::SerialPort;
use seriallink_types::LinkError;
use tracing::{debug, info};

use crate::device::SerialDevice;

/// Read timeout used when none is configured.  Short enough that a polling
/// loop never stalls on an idle line.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(10);

/// An open OS serial port (8N1, no flow control).
pub struct NativeSerial {
    name: String,
    port: Option<Box<dyn SerialPort>>,
}

impl NativeSerial {
    /// Open `path` at `baud_rate` with the given read `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::DeviceOpenFailure`] when the device is missing,
    /// busy, or rejects the settings.
    pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> Result<Self, LinkError> {
        let port = serialport::new(path, baud_rate)
            .timeout(timeout)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| LinkError::DeviceOpenFailure {
                device: path.to_string(),
                details: e.to_string(),
            })?;
        info!(device = %path, baud_rate, timeout_ms = timeout.as_millis() as u64, "serial port opened");
        Ok(Self {
            name: path.to_string(),
            port: Some(port),
        })
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, LinkError> {
        let name = &self.name;
        self.port.as_mut().ok_or_else(|| LinkError::TransientIo {
            component: name.clone(),
            details: "serial port is closed".to_string(),
        })
    }

    fn io_error(&self, op: &str, e: impl std::fmt::Display) -> LinkError {
        LinkError::TransientIo {
            component: self.name.clone(),
            details: format!("{op}: {e}"),
        }
    }
}

impl SerialDevice for NativeSerial {
    fn name(&self) -> &str {
        &self.name
    }

    fn bytes_waiting(&mut self) -> Result<usize, LinkError> {
        let result = self.port_mut()?.bytes_to_read();
        result
            .map(|n| n as usize)
            .map_err(|e| self.io_error("bytes_to_read", e))
    }

    fn read_available(&mut self, max: usize) -> Result<Vec<u8>, LinkError> {
        let mut buf = vec![0u8; max];
        let result = self.port_mut()?.read(&mut buf);
        match result {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) => Err(self.io_error("read", e)),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), LinkError> {
        let result = self.port_mut()?.write_all(data);
        result.map_err(|e| self.io_error("write", e))
    }

    fn close(&mut self) -> Result<(), LinkError> {
        if self.port.take().is_some() {
            debug!(device = %self.name, "serial port closed");
        }
        Ok(())
    }
}
