//! Serial port MAC backed by the `serialport` crate.

use std::io;
use std::io::{Read, Write};
use std::time::Duration;

use serialport::SerialPort;
use tracing::debug;

use super::Mac;

/// Per-call read timeout. Kept short so transports polling against their
/// own deadline observe expiry promptly.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// MAC over a local serial port (8N1, no flow control).
pub struct SerialPortMac {
    port_name: String,
    baud_rate: u32,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialPortMac {
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            port: None,
        }
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial MAC is not open"))
    }
}

impl Mac for SerialPortMac {
    fn open(&mut self) -> io::Result<()> {
        debug!(port = %self.port_name, baud_rate = self.baud_rate, "opening serial MAC");
        let port = serialport::new(&self.port_name, self.baud_rate)
            .timeout(READ_TIMEOUT)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(io::Error::from)?;
        // Stale bytes from a previous session would desynchronize framing.
        port.clear(serialport::ClearBuffer::Input).ok();
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        debug!(port = %self.port_name, "closing serial MAC");
        match self.port.take() {
            Some(port) => {
                drop(port);
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "serial MAC is not open",
            )),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port()?.read(buf) {
            Ok(count) => Ok(count),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.port()?.write_all(buf)
    }
}
