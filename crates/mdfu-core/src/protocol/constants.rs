//! Protocol constants from the Microchip MDFU specification.

use std::fmt;

/// MDFU protocol version implemented by this host.
pub const PROTOCOL_VERSION: &str = "1.2.0";
pub const PROTOCOL_VERSION_MAJOR: u8 = 1;
pub const PROTOCOL_VERSION_MINOR: u8 = 2;
pub const PROTOCOL_VERSION_PATCH: u8 = 0;

// ============================================================================
// Packet geometry
// ============================================================================

/// Size in bytes of the sequence field in the packet header.
pub const SEQUENCE_FIELD_SIZE: usize = 1;
/// Size in bytes of the command (or status) field in the packet header.
pub const COMMAND_FIELD_SIZE: usize = 1;

/// Largest command payload the host protocol buffers are configured for.
///
/// Client discovery rejects any client whose advertised buffer exceeds this.
pub const MAX_COMMAND_DATA_LENGTH: usize = 1024;
/// Largest status payload a client may return.
pub const MAX_RESPONSE_DATA_LENGTH: usize = 30;

/// Size in bytes of the largest expected MDFU command packet.
pub const CMD_PACKET_MAX_SIZE: usize =
    SEQUENCE_FIELD_SIZE + COMMAND_FIELD_SIZE + MAX_COMMAND_DATA_LENGTH;
/// Size in bytes of the largest expected MDFU status packet.
pub const RSP_PACKET_MAX_SIZE: usize =
    SEQUENCE_FIELD_SIZE + COMMAND_FIELD_SIZE + MAX_RESPONSE_DATA_LENGTH;

// ============================================================================
// Header byte layout
// ============================================================================

/// Sync bit in a command packet header.
pub const HEADER_SYNC: u8 = 0x80;
/// Resend bit in a status packet header.
pub const HEADER_RESEND: u8 = 0x40;
/// Sequence number mask, bits 0-4.
pub const HEADER_SEQUENCE: u8 = 0x1F;

// ============================================================================
// Command and status codes
// ============================================================================

/// MDFU command codes (host to client).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    GetClientInfo = 0x01,
    StartTransfer = 0x02,
    WriteChunk = 0x03,
    GetImageState = 0x04,
    EndTransfer = 0x05,
    ChangeMode = 0x06,
}

impl Command {
    /// Number of defined commands.
    pub const COUNT: usize = 6;

    /// All defined commands, in code order.
    pub const ALL: [Command; Self::COUNT] = [
        Command::GetClientInfo,
        Command::StartTransfer,
        Command::WriteChunk,
        Command::GetImageState,
        Command::EndTransfer,
        Command::ChangeMode,
    ];

    /// Decode a wire byte; zero and anything past the defined maximum is
    /// invalid.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Command::GetClientInfo),
            0x02 => Some(Command::StartTransfer),
            0x03 => Some(Command::WriteChunk),
            0x04 => Some(Command::GetImageState),
            0x05 => Some(Command::EndTransfer),
            0x06 => Some(Command::ChangeMode),
            _ => None,
        }
    }

    /// Zero-based index for per-command tables.
    pub(crate) fn index(self) -> usize {
        self as usize - 1
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::GetClientInfo => "Get Client Info",
            Command::StartTransfer => "Start Transfer",
            Command::WriteChunk => "Write Chunk",
            Command::GetImageState => "Get Image State",
            Command::EndTransfer => "End Transfer",
            Command::ChangeMode => "Change Mode",
        };
        write!(f, "{name}")
    }
}

/// MDFU status codes (client to host).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Success = 0x01,
    NotSupported = 0x02,
    NotAuthorized = 0x03,
    NotExecuted = 0x04,
    TransferFailure = 0x05,
    AbortFileTransfer = 0x06,
}

impl Status {
    /// Decode a wire byte; zero and anything past the defined maximum is
    /// invalid.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Status::Success),
            0x02 => Some(Status::NotSupported),
            0x03 => Some(Status::NotAuthorized),
            0x04 => Some(Status::NotExecuted),
            0x05 => Some(Status::TransferFailure),
            0x06 => Some(Status::AbortFileTransfer),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Success => "Success",
            Status::NotSupported => "Command not supported",
            Status::NotAuthorized => "Command not authorized",
            Status::NotExecuted => "Command not executed",
            Status::TransferFailure => "Transfer failure",
            Status::AbortFileTransfer => "Abort file transfer",
        };
        write!(f, "{name}")
    }
}

/// Image state byte returned in a GET_IMAGE_STATE response.
pub const IMAGE_STATE_VALID: u8 = 0x01;
pub const IMAGE_STATE_INVALID: u8 = 0x02;

// ============================================================================
// Error cause tables
// ============================================================================

/// Causes reported in the first payload byte of a COMMAND_NOT_EXECUTED
/// status.
const CMD_NOT_EXECUTED_CAUSES: [&str; 4] = [
    "Command received failed the transport integrity check, indicating that \
     the command was corrupted during transportation from the host to the client",
    "Received command exceeded the size of the client buffer",
    "Received command was too short",
    "Sequence number of the received command is invalid",
];

/// Causes reported in the first payload byte of an ABORT_FILE_TRANSFER
/// status.
const FILE_TRANSFER_ABORT_CAUSES: [&str; 8] = [
    "Generic problem encountered by client",
    "Generic problem with the update file",
    "The update file is not compatible with the client device ID",
    "An invalid address is present in the update file",
    "Client memory did not properly erase",
    "Client memory did not properly write",
    "Client memory did not properly read",
    "Client did not allow changing to the application version in the update file",
];

/// Look up the description for a cause byte. `None` for a cause at or past
/// the defined maximum, which the client should never send.
pub fn cause_description(status: Status, cause: u8) -> Option<&'static str> {
    let table: &[&'static str] = match status {
        Status::NotExecuted => &CMD_NOT_EXECUTED_CAUSES,
        Status::AbortFileTransfer => &FILE_TRANSFER_ABORT_CAUSES,
        _ => return None,
    };
    table.get(cause as usize).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_codes_round_trip() {
        for command in Command::ALL {
            assert_eq!(Command::from_code(command as u8), Some(command));
        }
    }

    #[test]
    fn command_code_bounds() {
        assert_eq!(Command::from_code(0), None);
        assert_eq!(Command::from_code(0x07), None);
        assert_eq!(Command::from_code(0xFF), None);
    }

    #[test]
    fn status_code_bounds() {
        assert_eq!(Status::from_code(0x01), Some(Status::Success));
        assert_eq!(Status::from_code(0x06), Some(Status::AbortFileTransfer));
        assert_eq!(Status::from_code(0), None);
        assert_eq!(Status::from_code(0x07), None);
    }

    #[test]
    fn cause_lookup_rejects_out_of_range() {
        assert!(cause_description(Status::NotExecuted, 3).is_some());
        assert!(cause_description(Status::NotExecuted, 4).is_none());
        assert!(cause_description(Status::AbortFileTransfer, 7).is_some());
        assert!(cause_description(Status::AbortFileTransfer, 8).is_none());
        assert!(cause_description(Status::Success, 0).is_none());
    }
}
