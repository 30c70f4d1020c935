//! SPI MAC backed by the Linux spidev interface.

use std::io;

use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};
use tracing::debug;

use super::Mac;

/// MAC over a `/dev/spidevX.Y` device.
pub struct SpidevMac {
    path: String,
    speed_hz: u32,
    mode: u8,
    device: Option<Spidev>,
}

impl SpidevMac {
    pub fn new(path: impl Into<String>, speed_hz: u32, mode: u8) -> Self {
        Self {
            path: path.into(),
            speed_hz,
            mode,
            device: None,
        }
    }

    fn device(&mut self) -> io::Result<&mut Spidev> {
        self.device
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "spidev MAC is not open"))
    }

    fn mode_flags(&self) -> io::Result<SpiModeFlags> {
        match self.mode {
            0 => Ok(SpiModeFlags::SPI_MODE_0),
            1 => Ok(SpiModeFlags::SPI_MODE_1),
            2 => Ok(SpiModeFlags::SPI_MODE_2),
            3 => Ok(SpiModeFlags::SPI_MODE_3),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid SPI mode {other}, expected 0-3"),
            )),
        }
    }
}

impl Mac for SpidevMac {
    fn open(&mut self) -> io::Result<()> {
        debug!(path = %self.path, speed_hz = self.speed_hz, mode = self.mode, "opening spidev MAC");
        let mut device = Spidev::open(&self.path)?;
        let options = SpidevOptions::new()
            .bits_per_word(8)
            .max_speed_hz(self.speed_hz)
            .mode(self.mode_flags()?)
            .build();
        device.configure(&options)?;
        self.device = Some(device);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        debug!(path = %self.path, "closing spidev MAC");
        match self.device.take() {
            Some(device) => {
                drop(device);
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "spidev MAC is not open",
            )),
        }
    }

    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        // SPI is full duplex; reads happen through `exchange`.
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "spidev MAC reads only through full-duplex exchanges",
        ))
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut discard = vec![0u8; buf.len()];
        self.exchange(buf, &mut discard)
    }

    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<()> {
        let device = self.device()?;
        let mut transfer = SpidevTransfer::read_write(tx, rx);
        device.transfer(&mut transfer)
    }
}
