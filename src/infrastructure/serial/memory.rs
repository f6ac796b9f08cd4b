//! In-process virtual serial device.
//!
//! [`MemoryDevice`] plays the role of the hardware: bytes written with
//! [`MemoryDevice::feed`] become readable on the open stream, and the device
//! can be unplugged, held busy or made to fail a read. [`MemoryDriver`] opens
//! it through the same [`SerialDriver`] interface the native driver uses.

use crate::domain::error::{SerialFault, SerialFaultKind};
use crate::infrastructure::serial::driver::{SerialDriver, SerialStream};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct DeviceState {
    present: bool,
    busy: bool,
    rx: Vec<u8>,
    construct_faults: VecDeque<SerialFaultKind>,
    open_faults: VecDeque<SerialFaultKind>,
    read_fault: Option<io::ErrorKind>,
    construct_calls: usize,
    open_calls: usize,
    open_streams: usize,
}

/// Shared handle to a virtual device. Clones refer to the same device.
#[derive(Debug, Clone, Default)]
pub struct MemoryDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MemoryDevice {
    /// A device that is plugged in and idle.
    pub fn new() -> Self {
        let device = Self::default();
        device.lock().present = true;
        device
    }

    /// A device that is not plugged in yet.
    pub fn absent() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        // Poisoning only follows a panic in another test thread
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn driver(&self) -> MemoryDriver {
        MemoryDriver {
            device: self.clone(),
        }
    }

    /// Make bytes available to the reader, as if they arrived on the line.
    pub fn feed(&self, data: &[u8]) {
        self.lock().rx.extend_from_slice(data);
    }

    pub fn plug_in(&self) {
        self.lock().present = true;
    }

    /// Remove the device. Open streams fail their next read.
    pub fn unplug(&self) {
        let mut state = self.lock();
        state.present = false;
        state.rx.clear();
    }

    pub fn set_busy(&self, busy: bool) {
        self.lock().busy = busy;
    }

    /// Fail the next `construct` calls with the given kinds, in order.
    pub fn fail_construct(&self, kinds: &[SerialFaultKind]) {
        self.lock().construct_faults.extend(kinds.iter().copied());
    }

    /// Fail the next `open` calls with the given kinds, in order.
    pub fn fail_open(&self, kinds: &[SerialFaultKind]) {
        self.lock().open_faults.extend(kinds.iter().copied());
    }

    /// Fail the next read on an open stream.
    pub fn fail_next_read(&self, kind: io::ErrorKind) {
        self.lock().read_fault = Some(kind);
    }

    pub fn construct_calls(&self) -> usize {
        self.lock().construct_calls
    }

    pub fn open_calls(&self) -> usize {
        self.lock().open_calls
    }

    /// Streams currently open on this device.
    pub fn open_streams(&self) -> usize {
        self.lock().open_streams
    }
}

/// [`SerialDriver`] for a [`MemoryDevice`].
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    device: MemoryDevice,
}

impl SerialDriver for MemoryDriver {
    type Stream = MemoryStream;

    fn construct(&mut self, device: &str, _baud_rate: u32) -> Result<(), SerialFault> {
        let mut state = self.device.lock();
        state.construct_calls += 1;

        if let Some(kind) = state.construct_faults.pop_front() {
            return Err(SerialFault::new(kind, "injected construct failure"));
        }
        if !state.present {
            return Err(SerialFault::new(
                SerialFaultKind::NotFound,
                format!("{} is not present", device),
            ));
        }
        Ok(())
    }

    fn open(&mut self, device: &str, _baud_rate: u32) -> Result<Self::Stream, SerialFault> {
        let mut state = self.device.lock();
        state.open_calls += 1;

        if let Some(kind) = state.open_faults.pop_front() {
            return Err(SerialFault::new(kind, "injected open failure"));
        }
        if !state.present {
            return Err(SerialFault::new(
                SerialFaultKind::NotFound,
                format!("{} is not present", device),
            ));
        }
        if state.busy || state.open_streams > 0 {
            return Err(SerialFault::new(
                SerialFaultKind::Busy,
                format!("{} is held by another handle", device),
            ));
        }

        state.open_streams += 1;
        Ok(MemoryStream {
            device: self.device.clone(),
        })
    }
}

/// Open stream on a [`MemoryDevice`]; closes the device when dropped.
#[derive(Debug)]
pub struct MemoryStream {
    device: MemoryDevice,
}

impl MemoryStream {
    fn check(&self, state: &mut DeviceState) -> io::Result<()> {
        if let Some(kind) = state.read_fault.take() {
            return Err(io::Error::new(kind, "injected read failure"));
        }
        if !state.present {
            return Err(io::Error::new(io::ErrorKind::NotFound, "device removed"));
        }
        Ok(())
    }
}

impl SerialStream for MemoryStream {
    fn bytes_available(&self) -> io::Result<u32> {
        let mut state = self.device.lock();
        self.check(&mut state)?;
        Ok(state.rx.len().min(u32::MAX as usize) as u32)
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.device.lock();
        self.check(&mut state)?;
        let n = buf.len().min(state.rx.len());
        buf[..n].copy_from_slice(&state.rx[..n]);
        state.rx.drain(..n);
        Ok(n)
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        let mut state = self.device.lock();
        state.open_streams = state.open_streams.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_open_handle() {
        let device = MemoryDevice::new();
        let mut driver = device.driver();

        let stream = driver.open("virtual0", 9600).unwrap();
        assert_eq!(device.open_streams(), 1);

        let second = driver.open("virtual0", 9600).unwrap_err();
        assert_eq!(second.kind, SerialFaultKind::Busy);

        drop(stream);
        assert_eq!(device.open_streams(), 0);
        assert!(driver.open("virtual0", 9600).is_ok());
    }

    #[test]
    fn test_feed_and_read() {
        let device = MemoryDevice::new();
        let mut stream = device.driver().open("virtual0", 9600).unwrap();

        device.feed(b"abc");
        device.feed(b"def");
        assert_eq!(stream.bytes_available().unwrap(), 6);

        let mut buf = [0u8; 6];
        assert_eq!(stream.read_bytes(&mut buf).unwrap(), 6);
        assert_eq!(&buf, b"abcdef");
        assert_eq!(stream.bytes_available().unwrap(), 0);
    }

    #[test]
    fn test_unplug_fails_reads() {
        let device = MemoryDevice::new();
        let stream = device.driver().open("virtual0", 9600).unwrap();

        device.unplug();
        let err = stream.bytes_available().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        let fault = device.driver().construct("virtual0", 9600).unwrap_err();
        assert_eq!(fault.kind, SerialFaultKind::NotFound);
    }

    #[test]
    fn test_injected_faults_are_consumed_in_order() {
        let device = MemoryDevice::new();
        let mut driver = device.driver();
        device.fail_construct(&[SerialFaultKind::Busy, SerialFaultKind::NotFound]);

        assert_eq!(driver.construct("v", 9600).unwrap_err().kind, SerialFaultKind::Busy);
        assert_eq!(driver.construct("v", 9600).unwrap_err().kind, SerialFaultKind::NotFound);
        assert!(driver.construct("v", 9600).is_ok());
        assert_eq!(device.construct_calls(), 3);
    }
}
