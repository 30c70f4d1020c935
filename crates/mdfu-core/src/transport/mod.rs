//! Transport layer abstraction.
//!
//! A transport frames MDFU packets onto the wire, delivers whole packets
//! back and enforces frame integrity. Three framings exist: escaped serial
//! frames, polled SPI retrieval and polled I²C retrieval; the network tool
//! tunnels the serial framing over a TCP socket.

pub mod i2c;
pub mod mock;
pub mod serial;
pub mod spi;

use std::io;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

pub use i2c::I2cTransport;
pub use mock::MockTransport;
pub use serial::SerialTransport;
pub use spi::SpiTransport;

#[derive(Error, Debug)]
pub enum TransportError {
    /// No complete frame arrived before the command deadline.
    #[error("timed out waiting for a client response")]
    Timeout,

    /// Frame check sequence verification failed.
    #[error("frame checksum mismatch: calculated 0x{calculated:04x} but got 0x{received:04x}")]
    ChecksumMismatch { calculated: u16, received: u16 },

    /// A byte other than an escaped reserved code followed the escape code.
    #[error("invalid code 0x{0:02x} after escape code")]
    InvalidEscape(u8),

    /// Decoded frame is smaller than one status byte plus the checksum.
    #[error("frame of {0} bytes is too short to carry a packet")]
    FrameTooShort(usize),

    /// The frame outgrew the receive buffer before its end code arrived.
    #[error("frame exceeds the {max} byte receive buffer")]
    BufferOverflow { max: usize },

    /// The client announced a response larger than the host accepts.
    #[error("client response of {size} bytes exceeds the {max} byte limit")]
    OversizeResponse { size: usize, max: usize },

    /// The client announced a response smaller than its own checksum.
    #[error("client response length {0} is shorter than the frame checksum")]
    ShortResponse(usize),

    /// The packet does not fit the transport frame buffer.
    #[error("command of {size} bytes exceeds the {max} byte frame buffer")]
    OversizeCommand { size: usize, max: usize },

    /// MAC layer failure passed through.
    #[error("MAC I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Transport-specific control requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ioctl {
    /// Minimum pause between bus transactions, pushed down from the client
    /// info block. Honored by the polled SPI and I²C transports.
    InterTransactionDelay(Duration),
}

/// Packet-granular access to a framed link.
pub trait Transport: Send {
    fn open(&mut self) -> Result<(), TransportError>;

    fn close(&mut self) -> Result<(), TransportError>;

    /// Frame and send one MDFU packet.
    fn write(&mut self, packet: &[u8]) -> Result<(), TransportError>;

    /// Receive one whole MDFU packet, waiting at most `timeout`.
    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Transport controls. The default implementation accepts and ignores
    /// every request, which is the null control of transports that have
    /// nothing to configure.
    fn ioctl(&mut self, _request: Ioctl) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Pacing gate enforcing the inter-transaction delay.
///
/// `wait` blocks until the delay since the previous `rearm` has elapsed;
/// `rearm` is called right after each bus transaction completes. Delay
/// updates take effect on the next rearm.
#[derive(Debug)]
pub(crate) struct ItdGate {
    delay: Duration,
    ready_at: Instant,
}

impl ItdGate {
    pub(crate) fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            ready_at: Instant::now(),
        }
    }

    pub(crate) fn set_delay(&mut self, delay: Duration) {
        self.delay = delay;
    }

    pub(crate) fn wait(&self) {
        let now = Instant::now();
        if now < self.ready_at {
            thread::sleep(self.ready_at - now);
        }
    }

    pub(crate) fn rearm(&mut self) {
        self.ready_at = Instant::now() + self.delay;
    }
}
