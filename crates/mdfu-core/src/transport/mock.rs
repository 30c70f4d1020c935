//! Scripted transport for protocol-level unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Ioctl, Transport, TransportError};
use crate::protocol::packet::StatusPacket;

#[derive(Default)]
struct Inner {
    /// Scripted outcomes served to `read`, one per call.
    reads: VecDeque<Result<Vec<u8>, TransportError>>,
    /// Captured packets passed to `write`.
    writes: Vec<Vec<u8>>,
    /// Number of upcoming writes that fail.
    failing_writes: usize,
    /// Every inter-transaction delay pushed through `ioctl`.
    delays: Vec<Duration>,
    opened: bool,
}

/// Mock transport that replays scripted responses and captures writes.
///
/// Clones share state, so a test can keep one handle for assertions after
/// moving another into a session.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<Inner>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a status packet to be returned by the next unanswered read.
    pub fn queue_status(&self, status: &StatusPacket) {
        self.queue_read(status.encode());
    }

    /// Queue raw packet bytes.
    pub fn queue_read(&self, bytes: Vec<u8>) {
        self.inner.lock().unwrap().reads.push_back(Ok(bytes));
    }

    /// Queue a read failure.
    pub fn queue_read_error(&self, error: TransportError) {
        self.inner.lock().unwrap().reads.push_back(Err(error));
    }

    /// Make the next `count` writes fail with an I/O error.
    pub fn fail_writes(&self, count: usize) {
        self.inner.lock().unwrap().failing_writes = count;
    }

    /// All captured command packets, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().writes.clone()
    }

    /// Inter-transaction delays pushed by the protocol layer, in order.
    pub fn delays(&self) -> Vec<Duration> {
        self.inner.lock().unwrap().delays.clone()
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().unwrap().opened
    }
}

impl Transport for MockTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        self.inner.lock().unwrap().opened = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.inner.lock().unwrap().opened = false;
        Ok(())
    }

    fn write(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(TransportError::Io(std::io::Error::other(
                "scripted write failure",
            )));
        }
        inner.writes.push(packet.to_vec());
        Ok(())
    }

    fn read(&mut self, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.inner
            .lock()
            .unwrap()
            .reads
            .pop_front()
            .unwrap_or(Err(TransportError::Timeout))
    }

    fn ioctl(&mut self, request: Ioctl) -> Result<(), TransportError> {
        match request {
            Ioctl::InterTransactionDelay(delay) => {
                self.inner.lock().unwrap().delays.push(delay);
                Ok(())
            }
        }
    }
}
