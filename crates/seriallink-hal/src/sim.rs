//! In-process serial simulation for CI/CD testing without physical hardware.
//!
//! [`SimSerial`] is a cloneable handle onto shared state: the test keeps one
//! clone to script arrivals and inspect writes while the code under test owns
//! another.  Each scripted arrival models one physical read: it becomes
//! visible on its own and is only followed by the next arrival once drained.
//!
//! # Example
//!
//! ```rust
//! use seriallink_hal::{SerialDevice, SimSerial};
//!
//! let sim = SimSerial::new("sim0");
//! let mut dev = sim.clone();
//!
//! sim.push_arrival(b"\xFF\xFF\x01");
//! assert_eq!(dev.bytes_waiting().unwrap(), 3);
//! assert_eq!(dev.read_available(3).unwrap(), vec![0xFF, 0xFF, 0x01]);
//!
//! dev.write_all(b"ping").unwrap();
//! assert_eq!(sim.written(), vec![b"ping".to_vec()]);
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use seriallink_types::LinkError;

use crate::device::SerialDevice;

#[derive(Default)]
struct SimState {
    arrivals: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
    failing_writes: usize,
    closed: bool,
}

/// A scripted serial device.  Always succeeds unless a write failure has
/// been armed with [`SimSerial::fail_next_writes`].
#[derive(Clone)]
pub struct SimSerial {
    name: String,
    state: Arc<Mutex<SimState>>,
}

impl SimSerial {
    /// Create a new simulated device with the given label.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    /// Queue `chunk` as the next batch of bytes arriving on the line.
    pub fn push_arrival(&self, chunk: &[u8]) {
        if !chunk.is_empty() {
            self.lock().arrivals.push_back(chunk.to_vec());
        }
    }

    /// Every successful write so far, one entry per call.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.lock().written.clone()
    }

    /// Make the next `count` writes fail with [`LinkError::TransientIo`].
    pub fn fail_next_writes(&self, count: usize) {
        self.lock().failing_writes = count;
    }

    /// `true` once [`SerialDevice::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn closed_error(&self) -> LinkError {
        LinkError::TransientIo {
            component: self.name.clone(),
            details: "simulated port is closed".to_string(),
        }
    }
}

impl SerialDevice for SimSerial {
    fn name(&self) -> &str {
        &self.name
    }

    fn bytes_waiting(&mut self) -> Result<usize, LinkError> {
        let state = self.lock();
        if state.closed {
            return Err(self.closed_error());
        }
        Ok(state.arrivals.front().map_or(0, Vec::len))
    }

    fn read_available(&mut self, max: usize) -> Result<Vec<u8>, LinkError> {
        let mut state = self.lock();
        if state.closed {
            return Err(self.closed_error());
        }
        let Some(front) = state.arrivals.front_mut() else {
            return Ok(Vec::new());
        };
        if front.len() <= max {
            Ok(state.arrivals.pop_front().unwrap_or_default())
        } else {
            Ok(front.drain(..max).collect())
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), LinkError> {
        let mut state = self.lock();
        if state.closed {
            return Err(self.closed_error());
        }
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(LinkError::TransientIo {
                component: self.name.clone(),
                details: "simulated write failure".to_string(),
            });
        }
        state.written.push(data.to_vec());
        Ok(())
    }

    fn close(&mut self) -> Result<(), LinkError> {
        self.lock().closed = true;
        Ok(())
    }
}
