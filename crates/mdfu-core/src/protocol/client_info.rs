//! Client capability block decoding.
//!
//! A GET_CLIENT_INFO response carries a sequence of type-length-value
//! records that parameterize every later exchange: protocol version, buffer
//! geometry, per-command timeouts and the inter-transaction delay.

use std::fmt;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use super::constants::{
    Command, PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR, PROTOCOL_VERSION_PATCH,
};

/// Parameter type codes of the client info TLV stream.
const PARAM_PROTOCOL_VERSION: u8 = 1;
const PARAM_BUFFER_INFO: u8 = 2;
const PARAM_COMMAND_TIMEOUT: u8 = 3;
const PARAM_INTER_TRANSACTION_DELAY: u8 = 4;

/// Bytes per command timeout entry: command code plus a little-endian tick
/// count.
const COMMAND_TIMEOUT_SIZE: usize = 3;

/// Command timeouts are reported in ticks of 100 ms.
const TIMEOUT_TICK: Duration = Duration::from_millis(100);

/// Timeout assumed for commands the client never parameterized.
const FALLBACK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ClientInfoError {
    #[error("invalid MDFU client info parameter type {0}")]
    UnknownParameterType(u8),

    #[error("MDFU client info parameter length exceeds available data")]
    TruncatedParameter,

    #[error("invalid parameter length for client protocol version: expected 3 or 4 but got {0}")]
    InvalidVersionLength(u8),

    #[error("invalid parameter length for client buffer info: expected 3 but got {0}")]
    InvalidBufferInfoLength(u8),

    #[error(
        "invalid parameter length for client command timeouts: expected a positive multiple of 3 but got {0}"
    )]
    InvalidTimeoutLength(u8),

    #[error("invalid command code 0x{0:02x} in client command timeouts")]
    InvalidTimeoutCommand(u8),

    #[error(
        "default client command timeout must be first in the parameter list but it is at position {0}"
    )]
    DefaultTimeoutNotFirst(usize),

    #[error("invalid parameter length for inter transaction delay: expected 4 but got {0}")]
    InvalidDelayLength(u8),
}

/// Client protocol version, optionally with an internal build number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub internal: Option<u8>,
}

impl ProtocolVersion {
    /// Whether this version is strictly newer than the protocol version the
    /// host implements. The internal number does not participate.
    pub fn is_newer_than_host(&self) -> bool {
        (self.major, self.minor, self.patch)
            > (
                PROTOCOL_VERSION_MAJOR,
                PROTOCOL_VERSION_MINOR,
                PROTOCOL_VERSION_PATCH,
            )
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(internal) = self.internal {
            write!(f, "-{internal}")?;
        }
        Ok(())
    }
}

/// Decoded client capability record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub version: ProtocolVersion,
    /// Maximum command payload the client accepts, in bytes.
    pub buffer_size: u16,
    /// Number of command buffers the client operates.
    pub buffer_count: u8,
    /// Response timeout for commands without an individual override.
    pub default_timeout: Duration,
    cmd_timeouts: [Duration; Command::COUNT],
    /// Minimum pause the client requires between bus transactions.
    pub inter_transaction_delay: Duration,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            version: ProtocolVersion {
                major: 0,
                minor: 0,
                patch: 0,
                internal: None,
            },
            buffer_size: 0,
            buffer_count: 0,
            default_timeout: FALLBACK_TIMEOUT,
            cmd_timeouts: [FALLBACK_TIMEOUT; Command::COUNT],
            inter_transaction_delay: Duration::ZERO,
        }
    }
}

impl ClientInfo {
    /// Decode the TLV parameter stream of a GET_CLIENT_INFO response.
    pub fn decode(data: &[u8]) -> Result<Self, ClientInfoError> {
        let mut info = ClientInfo::default();
        let mut offset = 0;

        while offset < data.len() {
            if offset + 2 > data.len() {
                return Err(ClientInfoError::TruncatedParameter);
            }
            let parameter_type = data[offset];
            let parameter_length = data[offset + 1];
            let end = offset + 2 + parameter_length as usize;
            if end > data.len() {
                return Err(ClientInfoError::TruncatedParameter);
            }
            let value = &data[offset + 2..end];
            offset = end;

            match parameter_type {
                PARAM_PROTOCOL_VERSION => info.decode_protocol_version(parameter_length, value)?,
                PARAM_BUFFER_INFO => info.decode_buffer_info(parameter_length, value)?,
                PARAM_COMMAND_TIMEOUT => info.decode_command_timeouts(parameter_length, value)?,
                PARAM_INTER_TRANSACTION_DELAY => info.decode_delay(parameter_length, value)?,
                other => return Err(ClientInfoError::UnknownParameterType(other)),
            }
        }
        Ok(info)
    }

    /// Response timeout for one command, derived from the client parameters.
    pub fn command_timeout(&self, command: Command) -> Duration {
        self.cmd_timeouts[command.index()]
    }

    fn decode_protocol_version(&mut self, length: u8, value: &[u8]) -> Result<(), ClientInfoError> {
        match length {
            3 | 4 => {
                self.version = ProtocolVersion {
                    major: value[0],
                    minor: value[1],
                    patch: value[2],
                    internal: value.get(3).copied(),
                };
                Ok(())
            }
            other => Err(ClientInfoError::InvalidVersionLength(other)),
        }
    }

    fn decode_buffer_info(&mut self, length: u8, value: &[u8]) -> Result<(), ClientInfoError> {
        if length != 3 {
            return Err(ClientInfoError::InvalidBufferInfoLength(length));
        }
        self.buffer_size = LittleEndian::read_u16(&value[..2]);
        self.buffer_count = value[2];
        Ok(())
    }

    fn decode_command_timeouts(&mut self, length: u8, value: &[u8]) -> Result<(), ClientInfoError> {
        if length == 0 || length as usize % COMMAND_TIMEOUT_SIZE != 0 {
            return Err(ClientInfoError::InvalidTimeoutLength(length));
        }
        for (position, entry) in value.chunks_exact(COMMAND_TIMEOUT_SIZE).enumerate() {
            let code = entry[0];
            let timeout = TIMEOUT_TICK * u32::from(LittleEndian::read_u16(&entry[1..3]));

            if code == 0 {
                // Command code zero carries the default and must lead the
                // list so individual overrides are not clobbered.
                if position != 0 {
                    return Err(ClientInfoError::DefaultTimeoutNotFirst(position));
                }
                self.default_timeout = timeout;
                self.cmd_timeouts = [timeout; Command::COUNT];
            } else {
                let command =
                    Command::from_code(code).ok_or(ClientInfoError::InvalidTimeoutCommand(code))?;
                self.cmd_timeouts[command.index()] = timeout;
            }
        }
        Ok(())
    }

    fn decode_delay(&mut self, length: u8, value: &[u8]) -> Result<(), ClientInfoError> {
        if length != 4 {
            return Err(ClientInfoError::InvalidDelayLength(length));
        }
        self.inter_transaction_delay =
            Duration::from_nanos(u64::from(LittleEndian::read_u32(value)));
        Ok(())
    }
}

impl fmt::Display for ClientInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "MDFU client information")?;
        writeln!(f, "--------------------------------")?;
        writeln!(f, "- MDFU protocol version: {}", self.version)?;
        writeln!(f, "- Number of command buffers: {}", self.buffer_count)?;
        writeln!(f, "- Maximum packet data length: {} bytes", self.buffer_size)?;
        writeln!(
            f,
            "- Inter transaction delay: {:.6} seconds",
            self.inter_transaction_delay.as_secs_f64()
        )?;
        writeln!(f, "Command timeouts")?;
        writeln!(
            f,
            "- Default timeout: {:.1} seconds",
            self.default_timeout.as_secs_f64()
        )?;
        for command in Command::ALL {
            writeln!(
                f,
                "- {}: {:.1} seconds",
                command,
                self.command_timeout(command).as_secs_f64()
            )?;
        }
        Ok(())
    }
}
