//! Protocol module - MDFU packet and capability definitions.

pub mod client_info;
pub mod constants;
pub mod packet;

pub use client_info::{ClientInfo, ClientInfoError, ProtocolVersion};
pub use constants::*;
pub use packet::{CommandPacket, PacketError, StatusPacket};

/// Render a byte slice as lowercase hex for packet logging.
pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
