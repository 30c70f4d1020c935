//! I²C MAC backed by the Linux i2cdev interface.

use std::io;

use i2cdev::core::I2CDevice;
use i2cdev::linux::LinuxI2CDevice;
use tracing::debug;

use super::Mac;

/// MAC over a `/dev/i2c-N` bus with a fixed client address.
pub struct I2cDevMac {
    path: String,
    address: u16,
    device: Option<LinuxI2CDevice>,
}

impl I2cDevMac {
    pub fn new(path: impl Into<String>, address: u16) -> Self {
        Self {
            path: path.into(),
            address,
            device: None,
        }
    }

    fn device(&mut self) -> io::Result<&mut LinuxI2CDevice> {
        self.device
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "i2cdev MAC is not open"))
    }
}

impl Mac for I2cDevMac {
    fn open(&mut self) -> io::Result<()> {
        debug!(path = %self.path, address = format!("0x{:02x}", self.address), "opening i2cdev MAC");
        let device = LinuxI2CDevice::new(&self.path, self.address).map_err(io::Error::other)?;
        self.device = Some(device);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        debug!(path = %self.path, "closing i2cdev MAC");
        match self.device.take() {
            Some(device) => {
                drop(device);
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "i2cdev MAC is not open",
            )),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // One bus read transaction; the kernel driver fills the whole
        // buffer or fails.
        self.device()?.read(buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        // A client that is busy NAKs the address byte, which lands here as
        // an error from the kernel driver.
        self.device()?.write(buf).map_err(io::Error::other)
    }
}
