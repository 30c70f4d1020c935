//! Tool registry - maps a tool choice onto a MAC driver plus a transport.
//!
//! A tool is the physical access path to the client: a local serial port, a
//! TCP tunnel, or a Linux spidev/i2cdev node. Each tool carries its own
//! parameters, which can come from the command line or from a TOML config
//! file.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::mac::{SerialPortMac, SocketMac};
use crate::transport::{SerialTransport, Transport};

#[cfg(target_os = "linux")]
use crate::mac::{I2cDevMac, SpidevMac};
#[cfg(target_os = "linux")]
use crate::transport::{I2cTransport, SpiTransport};

const DEFAULT_BAUDRATE: u32 = 115_200;
#[cfg(target_os = "linux")]
const DEFAULT_SPI_CLK_SPEED: u32 = 1_000_000;
#[cfg(target_os = "linux")]
const DEFAULT_SPI_MODE: u8 = 0;

/// The tools this host knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Serial,
    Network,
    Spidev,
    I2cdev,
}

impl ToolKind {
    /// All tool names, in registry order.
    pub const NAMES: [&'static str; 4] = ["serial", "network", "spidev", "i2cdev"];

    pub fn name(self) -> &'static str {
        match self {
            ToolKind::Serial => "serial",
            ToolKind::Network => "network",
            ToolKind::Spidev => "spidev",
            ToolKind::I2cdev => "i2cdev",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ToolKind {
    type Err = anyhow::Error;

    fn from_str(name: &str) -> Result<Self> {
        match name {
            "serial" => Ok(ToolKind::Serial),
            "network" => Ok(ToolKind::Network),
            "spidev" => Ok(ToolKind::Spidev),
            "i2cdev" => Ok(ToolKind::I2cdev),
            other => bail!(
                "unknown tool \"{other}\", valid tools are: {}",
                Self::NAMES.join(", ")
            ),
        }
    }
}

/// Tool parameters, merged from the config file and the command line.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolConfig {
    /// Serial port, e.g. /dev/ttyACM0 (serial tool).
    pub port: Option<String>,
    /// Serial baud rate (serial tool).
    pub baudrate: Option<u32>,
    /// Tunnel host, e.g. 127.0.0.1 (network tool).
    pub host: Option<String>,
    /// Tunnel TCP port (network tool).
    pub tcp_port: Option<u16>,
    /// Device node, e.g. /dev/spidev0.0 or /dev/i2c-0 (spidev/i2cdev tools).
    pub dev: Option<String>,
    /// SPI clock speed in Hz (spidev tool).
    pub clk_speed: Option<u32>,
    /// SPI mode, 0-3 (spidev tool).
    pub mode: Option<u8>,
    /// I²C client address (i2cdev tool).
    pub address: Option<u16>,
}

impl ToolConfig {
    /// Overlay `other` on top of `self`; set fields in `other` win.
    pub fn merged_with(&self, other: &ToolConfig) -> ToolConfig {
        ToolConfig {
            port: other.port.clone().or_else(|| self.port.clone()),
            baudrate: other.baudrate.or(self.baudrate),
            host: other.host.clone().or_else(|| self.host.clone()),
            tcp_port: other.tcp_port.or(self.tcp_port),
            dev: other.dev.clone().or_else(|| self.dev.clone()),
            clk_speed: other.clk_speed.or(self.clk_speed),
            mode: other.mode.or(self.mode),
            address: other.address.or(self.address),
        }
    }
}

/// Build the transport stack for a tool.
pub fn build_transport(kind: ToolKind, config: &ToolConfig) -> Result<Box<dyn Transport>> {
    match kind {
        ToolKind::Serial => {
            let port = config
                .port
                .clone()
                .context("the serial tool requires --port")?;
            let baudrate = config.baudrate.unwrap_or(DEFAULT_BAUDRATE);
            Ok(Box::new(SerialTransport::new(SerialPortMac::new(
                port, baudrate,
            ))))
        }
        ToolKind::Network => {
            let host = config
                .host
                .clone()
                .context("the network tool requires --host")?;
            let tcp_port = config
                .tcp_port
                .context("the network tool requires --tcp-port")?;
            // The tunnel forwards whole frames, so stage each frame into a
            // single MAC write instead of streaming bytes.
            Ok(Box::new(SerialTransport::buffered(SocketMac::new(
                host, tcp_port,
            ))))
        }
        #[cfg(target_os = "linux")]
        ToolKind::Spidev => {
            let dev = config.dev.clone().context("the spidev tool requires --dev")?;
            let clk_speed = config.clk_speed.unwrap_or(DEFAULT_SPI_CLK_SPEED);
            let mode = config.mode.unwrap_or(DEFAULT_SPI_MODE);
            Ok(Box::new(SpiTransport::new(SpidevMac::new(
                dev, clk_speed, mode,
            ))))
        }
        #[cfg(target_os = "linux")]
        ToolKind::I2cdev => {
            let dev = config.dev.clone().context("the i2cdev tool requires --dev")?;
            let address = config
                .address
                .context("the i2cdev tool requires --address")?;
            if address > 0x7F {
                bail!("I2C address 0x{address:02x} is outside the 7-bit range");
            }
            Ok(Box::new(I2cTransport::new(I2cDevMac::new(dev, address))))
        }
        #[cfg(not(target_os = "linux"))]
        ToolKind::Spidev | ToolKind::I2cdev => {
            bail!("the {kind} tool is only available on Linux")
        }
    }
}

/// Parameter help for one tool.
pub fn parameter_help(kind: ToolKind) -> &'static str {
    match kind {
        ToolKind::Serial => {
            "Serial tool options:\n\
             \x20   --port <port>: e.g. /dev/ttyACM0\n\
             \x20   --baudrate <baudrate>: e.g. 115200\n"
        }
        ToolKind::Network => {
            "Network tool options:\n\
             \x20   --host <host>: e.g. 127.0.0.1\n\
             \x20   --tcp-port <port>: e.g. 5559\n"
        }
        ToolKind::Spidev => {
            "Spidev tool options:\n\
             \x20   --dev <device>: e.g. /dev/spidev0.0\n\
             \x20   --clk-speed <clock speed>: e.g. 1000000\n\
             \x20   --mode <mode>: one of [0, 1, 2, 3]\n"
        }
        ToolKind::I2cdev => {
            "I2cdev tool options:\n\
             \x20   --dev <device>: e.g. /dev/i2c-0\n\
             \x20   --address <address>: e.g. 85\n"
        }
    }
}

/// Parameter help for every registered tool.
pub fn tools_help() -> String {
    let mut text = String::new();
    for name in ToolKind::NAMES {
        let kind = ToolKind::from_str(name).expect("registry names parse");
        text.push_str(parameter_help(kind));
        text.push('\n');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_names_round_trip() {
        for name in ToolKind::NAMES {
            assert_eq!(ToolKind::from_str(name).unwrap().name(), name);
        }
        assert!(ToolKind::from_str("usb").is_err());
    }

    #[test]
    fn command_line_overrides_config_file() {
        let file = ToolConfig {
            port: Some("/dev/ttyACM0".into()),
            baudrate: Some(9_600),
            ..Default::default()
        };
        let flags = ToolConfig {
            baudrate: Some(115_200),
            ..Default::default()
        };
        let merged = file.merged_with(&flags);
        assert_eq!(merged.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(merged.baudrate, Some(115_200));
    }

    #[test]
    fn serial_tool_requires_a_port() {
        let result = build_transport(ToolKind::Serial, &ToolConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn serial_tool_builds_with_defaults() {
        let config = ToolConfig {
            port: Some("/dev/ttyACM0".into()),
            ..Default::default()
        };
        assert!(build_transport(ToolKind::Serial, &config).is_ok());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn i2cdev_tool_rejects_out_of_range_address() {
        let config = ToolConfig {
            dev: Some("/dev/i2c-0".into()),
            address: Some(0x80),
            ..Default::default()
        };
        assert!(build_transport(ToolKind::I2cdev, &config).is_err());
    }

    #[test]
    fn help_covers_every_tool() {
        let help = tools_help().to_lowercase();
        for name in ToolKind::NAMES {
            assert!(help.contains(name));
        }
    }
}
