//! mdfu-core: Microchip Device Firmware Update host protocol in Rust.
//!
//! This crate drives an embedded MDFU client through a complete firmware
//! update: discover the client's capabilities, open a transfer, stream the
//! image in chunks, verify the resulting image and close the transfer.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: packet codes, encode/decode, client info TLV decoding
//! - **Transport**: serial framing, polled SPI and I²C retrieval, mock
//! - **MAC**: byte-granular port drivers (serialport, TCP, spidev, i2cdev)
//! - **Session**: sequencing, retries, timeouts, the update workflow
//! - **Events**: observer pattern for UI decoupling
//! - **Tools**: registry mapping a tool name onto a MAC/transport stack
//!
//! Everything is synchronous and single threaded: a session owns its
//! transport, the transport owns its MAC, and each layer blocks its caller
//! until an operation completes or its deadline fires.
//!
//! # Example
//!
//! ```no_run
//! use mdfu_core::image::FileImageReader;
//! use mdfu_core::session::MdfuSession;
//! use mdfu_core::tools::{ToolConfig, ToolKind, build_transport};
//!
//! let config = ToolConfig {
//!     port: Some("/dev/ttyACM0".to_string()),
//!     ..Default::default()
//! };
//! let transport = build_transport(ToolKind::Serial, &config).expect("tool setup");
//!
//! let mut session = MdfuSession::new(transport, 2);
//! session.open().expect("connecting to tool failed");
//! let mut image = FileImageReader::open("update_image.img").expect("image");
//! session.run_update(&mut image).expect("firmware update failed");
//! session.close().expect("close failed");
//! ```

pub mod checksum;
pub mod events;
pub mod image;
pub mod mac;
pub mod protocol;
pub mod session;
pub mod timeout;
pub mod tools;
pub mod transport;

// Re-exports for convenience
pub use events::{MdfuEvent, MdfuObserver, NullObserver, TracingObserver, UpdatePhase};
pub use image::{FileImageReader, ImageReader, MemoryImageReader};
pub use protocol::client_info::{ClientInfo, ClientInfoError, ProtocolVersion};
pub use protocol::constants::{Command, PROTOCOL_VERSION, Status};
pub use protocol::packet::{CommandPacket, PacketError, StatusPacket};
pub use session::{MdfuError, MdfuSession, SessionState};
pub use tools::{ToolConfig, ToolKind, build_transport, tools_help};
pub use transport::{Ioctl, MockTransport, Transport, TransportError};
