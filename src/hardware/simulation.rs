//! Simulation adapter for unit testing the protocol drivers without a
//! vehicle on the bench

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{DiagError, DiagResult};

use super::{BusInit, L0Device, L0Flags, SerialSettings};

#[derive(Debug, Default)]
struct Inner {
    rx: VecDeque<DiagResult<Vec<u8>>>,
    tx: Vec<Vec<u8>>,
    inits: Vec<BusInit>,
    speed: Option<SerialSettings>,
}

/// A scripted L0 device.
///
/// Tests queue the byte chunks (or errors) each `recv` call should yield
/// and inspect the transmissions afterwards. The script and the traffic
/// log live behind an `Arc`, so a clone kept by the test stays connected
/// to the device after a connection has taken ownership of the original.
/// An empty receive queue reads as a timeout, which is exactly how the
/// byte-accumulating receive state machines detect end-of-frame.
#[derive(Debug, Clone, Default)]
pub struct SimulationDevice {
    inner: Arc<Mutex<Inner>>,
    flags: L0Flags,
}

impl SimulationDevice {
    /// Creates a simulation device advertising the given capabilities
    pub fn new(flags: L0Flags) -> Self {
        Self {
            flags,
            ..Default::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Queues one chunk of bytes to be yielded by a future `recv` call
    pub fn queue_bytes(&self, bytes: &[u8]) {
        self.lock().rx.push_back(Ok(bytes.to_vec()));
    }

    /// Queues an error to be yielded by a future `recv` call
    pub fn queue_error(&self, err: DiagError) {
        self.lock().rx.push_back(Err(err));
    }

    /// Every buffer passed to [L0Device::send] so far, in order
    pub fn tx(&self) -> Vec<Vec<u8>> {
        self.lock().tx.clone()
    }

    /// Bytes of the most recent transmission
    pub fn last_tx(&self) -> Option<Vec<u8>> {
        self.lock().tx.last().cloned()
    }

    /// Every wake-up request performed, in order
    pub fn inits(&self) -> Vec<BusInit> {
        self.lock().inits.clone()
    }

    /// Line settings last applied via [L0Device::set_speed]
    pub fn line_settings(&self) -> Option<SerialSettings> {
        self.lock().speed
    }
}

impl L0Device for SimulationDevice {
    fn send(&mut self, data: &[u8]) -> DiagResult<()> {
        self.lock().tx.push(data.to_vec());
        Ok(())
    }

    fn recv(&mut self, max_len: usize, _timeout_ms: u64) -> DiagResult<Vec<u8>> {
        let mut inner = self.lock();
        match inner.rx.pop_front() {
            Some(Ok(mut chunk)) => {
                if chunk.len() > max_len {
                    // Hand back the remainder on the next call
                    let rest = chunk.split_off(max_len);
                    inner.rx.push_front(Ok(rest));
                }
                Ok(chunk)
            }
            Some(Err(e)) => Err(e),
            None => Err(DiagError::Timeout),
        }
    }

    fn init_bus(&mut self, init: BusInit) -> DiagResult<()> {
        self.lock().inits.push(init);
        Ok(())
    }

    fn set_speed(&mut self, settings: &SerialSettings) -> DiagResult<()> {
        self.lock().speed = Some(*settings);
        Ok(())
    }

    fn flush_input(&mut self) -> DiagResult<()> {
        Ok(())
    }

    fn flags(&self) -> L0Flags {
        self.flags
    }
}
