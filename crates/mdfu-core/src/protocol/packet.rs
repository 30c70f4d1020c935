//! MDFU packet encoding and decoding.
//!
//! Command and status packets share the same two-byte header layout: byte 0
//! carries the sequence number in bits 0-4 plus a flag bit (sync on
//! commands, resend on statuses), byte 1 carries the command or status code,
//! and any payload follows from byte 2.

use thiserror::Error;

use super::constants::{Command, HEADER_RESEND, HEADER_SEQUENCE, HEADER_SYNC, Status};

#[derive(Error, Debug)]
pub enum PacketError {
    /// The command code is zero or past the defined maximum.
    #[error("invalid MDFU command {0}")]
    InvalidCommand(u8),

    /// The status code is zero or past the defined maximum.
    #[error("invalid MDFU status {0}")]
    InvalidStatus(u8),

    /// Fewer bytes than the two-byte packet header.
    #[error("MDFU packet of {0} bytes is shorter than the packet header")]
    TooShort(usize),
}

/// A command packet, host to client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    /// Resets the client sequence counter to zero when set.
    pub sync: bool,
    /// Sequence number, 0..=31.
    pub sequence: u8,
    pub command: Command,
    pub data: Vec<u8>,
}

impl CommandPacket {
    pub fn new(command: Command, sync: bool, data: Vec<u8>) -> Self {
        Self {
            sync,
            sequence: 0,
            command,
            data,
        }
    }

    /// Encode into wire bytes. Encoded length is `2 + data.len()`.
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.sequence < 32);

        let mut bytes = Vec::with_capacity(2 + self.data.len());
        let mut header = self.sequence & HEADER_SEQUENCE;
        if self.sync {
            header |= HEADER_SYNC;
        }
        bytes.push(header);
        bytes.push(self.command as u8);
        bytes.extend_from_slice(&self.data);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < 2 {
            return Err(PacketError::TooShort(bytes.len()));
        }
        let command =
            Command::from_code(bytes[1]).ok_or(PacketError::InvalidCommand(bytes[1]))?;
        Ok(Self {
            sync: bytes[0] & HEADER_SYNC != 0,
            sequence: bytes[0] & HEADER_SEQUENCE,
            command,
            data: bytes[2..].to_vec(),
        })
    }
}

/// A status packet, client to host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPacket {
    /// The client asks the host to retransmit the same-numbered command.
    pub resend: bool,
    /// Sequence number, 0..=31.
    pub sequence: u8,
    pub status: Status,
    pub data: Vec<u8>,
}

impl StatusPacket {
    pub fn new(status: Status, resend: bool, sequence: u8, data: Vec<u8>) -> Self {
        Self {
            resend,
            sequence,
            status,
            data,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < 2 {
            return Err(PacketError::TooShort(bytes.len()));
        }
        let status = Status::from_code(bytes[1]).ok_or(PacketError::InvalidStatus(bytes[1]))?;
        Ok(Self {
            resend: bytes[0] & HEADER_RESEND != 0,
            sequence: bytes[0] & HEADER_SEQUENCE,
            status,
            data: bytes[2..].to_vec(),
        })
    }

    /// Encode into wire bytes. Only the client side of the link produces
    /// status packets, so outside of tests and mocks this goes unused.
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.sequence < 32);

        let mut bytes = Vec::with_capacity(2 + self.data.len());
        let mut header = self.sequence & HEADER_SEQUENCE;
        if self.resend {
            header |= HEADER_RESEND;
        }
        bytes.push(header);
        bytes.push(self.status as u8);
        bytes.extend_from_slice(&self.data);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::MAX_COMMAND_DATA_LENGTH;

    #[test]
    fn encode_sync_command() {
        // Sync bit set, Get Client Info, four payload bytes.
        let packet = CommandPacket {
            sync: true,
            sequence: 1,
            command: Command::GetClientInfo,
            data: vec![0x11, 0x22, 0x33, 0x44],
        };
        assert_eq!(packet.encode(), [0x81, 0x01, 0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn command_round_trip() {
        for sequence in [0u8, 7, 31] {
            for command in Command::ALL {
                let packet = CommandPacket {
                    sync: sequence == 0,
                    sequence,
                    command,
                    data: vec![0xA5; 3],
                };
                let decoded = CommandPacket::decode(&packet.encode()).unwrap();
                assert_eq!(decoded, packet);
            }
        }
    }

    #[test]
    fn empty_and_maximum_payloads_encode() {
        let empty = CommandPacket::new(Command::StartTransfer, false, Vec::new());
        assert_eq!(empty.encode().len(), 2);

        let full = CommandPacket::new(
            Command::WriteChunk,
            false,
            vec![0x56; MAX_COMMAND_DATA_LENGTH],
        );
        let encoded = full.encode();
        assert_eq!(encoded.len(), 2 + MAX_COMMAND_DATA_LENGTH);
        assert_eq!(CommandPacket::decode(&encoded).unwrap(), full);
    }

    #[test]
    fn decode_rejects_invalid_command() {
        assert!(matches!(
            CommandPacket::decode(&[0x00, 0x00]),
            Err(PacketError::InvalidCommand(0))
        ));
        assert!(matches!(
            CommandPacket::decode(&[0x00, 0x07]),
            Err(PacketError::InvalidCommand(7))
        ));
    }

    #[test]
    fn decode_rejects_invalid_status() {
        assert!(matches!(
            StatusPacket::decode(&[0x00, 0x00]),
            Err(PacketError::InvalidStatus(0))
        ));
        assert!(matches!(
            StatusPacket::decode(&[0x00, 0x09]),
            Err(PacketError::InvalidStatus(9))
        ));
    }

    #[test]
    fn decode_rejects_short_packet() {
        assert!(matches!(
            StatusPacket::decode(&[0x01]),
            Err(PacketError::TooShort(1))
        ));
    }

    #[test]
    fn status_resend_bit() {
        let bytes = [0x47, 0x01];
        let status = StatusPacket::decode(&bytes).unwrap();
        assert!(status.resend);
        assert_eq!(status.sequence, 7);
        assert_eq!(status.status, Status::Success);
        assert!(status.data.is_empty());
        assert_eq!(status.encode(), bytes);
    }
}
