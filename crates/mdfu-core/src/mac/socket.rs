//! TCP socket MAC for network-tunneled clients.

use std::io;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use tracing::debug;

use super::Mac;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-call read timeout; transports poll against their own deadline.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// MAC over a TCP connection to a tunnel endpoint that forwards raw frame
/// bytes to the client.
pub struct SocketMac {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
}

impl SocketMac {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            stream: None,
        }
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket MAC is not open"))
    }
}

impl Mac for SocketMac {
    fn open(&mut self) -> io::Result<()> {
        debug!(host = %self.host, port = self.port, "opening socket MAC");
        let address = std::net::ToSocketAddrs::to_socket_addrs(&(self.host.as_str(), self.port))?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no address found for {}", self.host),
                )
            })?;
        let stream = TcpStream::connect_timeout(&address, CONNECT_TIMEOUT)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        debug!(host = %self.host, port = self.port, "closing socket MAC");
        match self.stream.take() {
            Some(stream) => {
                drop(stream);
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "socket MAC is not open",
            )),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // A closed peer reads as silence here and surfaces upstream as a
        // transport timeout.
        match self.stream()?.read(buf) {
            Ok(count) => Ok(count),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream()?.write_all(buf)
    }
}
