//! Scripted MAC for transport-level unit tests.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use super::Mac;

#[derive(Default)]
struct Inner {
    /// Byte chunks served to `read`; one chunk models one bus transaction.
    reads: VecDeque<Vec<u8>>,
    /// Responses clocked back by `exchange`.
    exchanges: VecDeque<Vec<u8>>,
    /// Captured `write` and `exchange` transmissions.
    writes: Vec<Vec<u8>>,
    /// Number of upcoming writes that fail with an I/O error.
    failing_writes: usize,
    opened: bool,
}

/// Mock MAC that replays scripted reads and captures writes.
///
/// Clones share state, so a test can keep one handle for assertions after
/// moving another into a transport.
#[derive(Clone, Default)]
pub struct MockMac {
    inner: Arc<Mutex<Inner>>,
}

impl MockMac {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one read transaction worth of bytes.
    pub fn queue_read(&self, bytes: &[u8]) {
        self.inner.lock().unwrap().reads.push_back(bytes.to_vec());
    }

    /// Queue the client side of one full-duplex exchange.
    pub fn queue_exchange(&self, bytes: &[u8]) {
        self.inner
            .lock()
            .unwrap()
            .exchanges
            .push_back(bytes.to_vec());
    }

    /// Make the next `count` writes fail with an I/O error.
    pub fn fail_writes(&self, count: usize) {
        self.inner.lock().unwrap().failing_writes = count;
    }

    /// All captured transmissions, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().writes.clone()
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().unwrap().opened
    }
}

impl Mac for MockMac {
    fn open(&mut self) -> io::Result<()> {
        self.inner.lock().unwrap().opened = true;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.lock().unwrap().opened = false;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let Some(front) = inner.reads.front_mut() else {
            return Ok(0);
        };
        let count = front.len().min(buf.len());
        buf[..count].copy_from_slice(&front[..count]);
        front.drain(..count);
        if front.is_empty() {
            inner.reads.pop_front();
        }
        Ok(count)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(io::Error::other("scripted write failure"));
        }
        inner.writes.push(buf.to_vec());
        Ok(())
    }

    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(io::Error::other("scripted exchange failure"));
        }
        inner.writes.push(tx.to_vec());
        rx.fill(0);
        if let Some(response) = inner.exchanges.pop_front() {
            let count = response.len().min(rx.len());
            rx[..count].copy_from_slice(&response[..count]);
        }
        Ok(())
    }
}
