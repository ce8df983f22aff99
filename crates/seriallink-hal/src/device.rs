//! Generic `SerialDevice` trait for byte-stream hardware (UARTs, USB-serial
//! adapters, RS-485 transceivers, …).

use seriallink_types::LinkError;

/// A byte-oriented serial device.
///
/// Implementations must keep reads short: [`read_available`] should never
/// block much longer than the device's configured read timeout, so a polling
/// loop stays live on an idle line.
///
/// [`read_available`]: SerialDevice::read_available
pub trait SerialDevice: Send {
    /// Device path or label, e.g. `"/dev/ttyAMA0"`.
    fn name(&self) -> &str;

    /// Number of bytes received and waiting to be read.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::TransientIo`] if the driver cannot be queried.
    fn bytes_waiting(&mut self) -> Result<usize, LinkError>;

    /// Read up to `max` bytes.  Returns fewer (possibly none) when the read
    /// timeout expires first.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::TransientIo`] on a driver-level read failure.
    fn read_available(&mut self, max: usize) -> Result<Vec<u8>, LinkError>;

    /// Write every byte of `data` to the device.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::TransientIo`] if the write fails.
    fn write_all(&mut self, data: &[u8]) -> Result<(), LinkError>;

    /// Release the device.  Calling it again is a no-op.
    fn close(&mut self) -> Result<(), LinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Loopback device: every write becomes readable.
    struct LoopbackDevice {
        pending: VecDeque<u8>,
        open: bool,
    }

    impl SerialDevice for LoopbackDevice {
        fn name(&self) -> &str {
            "loopback"
        }

        fn bytes_waiting(&mut self) -> Result<usize, LinkError> {
            Ok(self.pending.len())
        }

        fn read_available(&mut self, max: usize) -> Result<Vec<u8>, LinkError> {
            let n = max.min(self.pending.len());
            Ok(self.pending.drain(..n).collect())
        }

        fn write_all(&mut self, data: &[u8]) -> Result<(), LinkError> {
            self.pending.extend(data);
            Ok(())
        }

        fn close(&mut self) -> Result<(), LinkError> {
            self.open = false;
            Ok(())
        }
    }

    #[test]
    fn loopback_device_through_trait_object() {
        let mut dev: Box<dyn SerialDevice> = Box::new(LoopbackDevice {
            pending: VecDeque::new(),
            open: true,
        });
        dev.write_all(b"Hello, world!").unwrap();
        assert_eq!(dev.bytes_waiting().unwrap(), 13);
        assert_eq!(dev.read_available(5).unwrap(), b"Hello");
        assert_eq!(dev.read_available(64).unwrap(), b", world!");
        assert_eq!(dev.bytes_waiting().unwrap(), 0);
        dev.close().unwrap();
    }
}
