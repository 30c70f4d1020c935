//! MAC layer abstraction.
//!
//! A MAC port moves raw bytes over one physical or emulated link. Transports
//! compose whole frames out of these byte-granular operations, so a MAC
//! implementation never needs to know about framing or packets.

pub mod mock;
pub mod serial;
pub mod socket;

#[cfg(target_os = "linux")]
pub mod i2cdev;
#[cfg(target_os = "linux")]
pub mod spidev;

use std::io;

pub use mock::MockMac;
pub use serial::SerialPortMac;
pub use socket::SocketMac;

#[cfg(target_os = "linux")]
pub use i2cdev::I2cDevMac;
#[cfg(target_os = "linux")]
pub use spidev::SpidevMac;

/// Byte-granular access to a physical or emulated link.
pub trait Mac: Send {
    fn open(&mut self) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()>;

    /// Read up to `buf.len()` bytes.
    ///
    /// Implementations must bound the wait themselves and return `Ok(0)`
    /// when no byte arrived in time; transports poll short reads like this
    /// against their own monotonic deadline.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Full-duplex exchange: clock out `tx` while capturing the same number
    /// of bytes into `rx`. Only meaningful on SPI links; everything else
    /// keeps this default.
    fn exchange(&mut self, _tx: &[u8], _rx: &mut [u8]) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "full-duplex exchange is not supported by this MAC",
        ))
    }
}
