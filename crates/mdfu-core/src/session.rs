//! MDFU session - sequenced command exchange and the update workflow.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info};

use crate::events::{MdfuEvent, MdfuObserver, TracingObserver, UpdatePhase};
use crate::image::ImageReader;
use crate::protocol::client_info::{ClientInfo, ClientInfoError, ProtocolVersion};
use crate::protocol::constants::{
    Command, HEADER_SEQUENCE, IMAGE_STATE_VALID, MAX_COMMAND_DATA_LENGTH, PROTOCOL_VERSION, Status,
    cause_description,
};
use crate::protocol::hex;
use crate::protocol::packet::{CommandPacket, PacketError, StatusPacket};
use crate::transport::{Ioctl, Transport, TransportError};

/// Response timeout before the client has told us its real timeouts.
const BOOTSTRAP_CMD_TIMEOUT: Duration = Duration::from_secs(1);

/// Conservative inter-transaction delay used while retrieving the client
/// info that carries the real value.
const BOOTSTRAP_INTER_TRANSACTION_DELAY: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum MdfuError {
    /// Every attempt of one exchange failed at the transport layer.
    #[error("tried {attempts} times to send command without success")]
    RetriesExhausted { attempts: u32 },

    /// The client breached the packet format.
    #[error(transparent)]
    Packet(#[from] PacketError),

    /// The client answered with a terminal non-success status.
    #[error("client reported: {status}")]
    Protocol { status: Status, cause: Option<u8> },

    /// The GET_CLIENT_INFO payload did not decode.
    #[error(transparent)]
    ClientInfo(#[from] ClientInfoError),

    /// The client speaks a newer protocol than this host.
    #[error("client protocol version {client} is not supported by host version {host}")]
    VersionMismatch {
        client: ProtocolVersion,
        host: &'static str,
    },

    /// The client wants commands larger than the host buffers allow.
    #[error("client requires a command data length of {required} but the host supports {max}")]
    BufferTooLarge { required: u16, max: usize },

    /// GET_IMAGE_STATE reported anything but a valid image.
    #[error("image state {0} is invalid")]
    ImageRejected(u8),

    /// Reading the firmware image failed.
    #[error("image read failed: {0}")]
    Image(#[from] std::io::Error),

    /// Transport failure outside the retried exchange path.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Per-session protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Open,
    ClientKnown,
    Transferring,
    Finalizing,
}

/// One MDFU session: owns the transport, the sequence counter and the
/// client capabilities for exactly one update.
pub struct MdfuSession<O: MdfuObserver = TracingObserver> {
    transport: Box<dyn Transport>,
    observer: Arc<O>,
    retries: u32,
    sequence: u8,
    state: SessionState,
    client_info: Option<ClientInfo>,
}

impl MdfuSession<TracingObserver> {
    /// Create a session with the default tracing observer.
    pub fn new(transport: Box<dyn Transport>, retries: u32) -> Self {
        Self::with_observer(transport, retries, Arc::new(TracingObserver))
    }
}

impl<O: MdfuObserver + 'static> MdfuSession<O> {
    /// Create a session with a custom observer.
    pub fn with_observer(transport: Box<dyn Transport>, retries: u32, observer: Arc<O>) -> Self {
        Self {
            transport,
            observer,
            retries,
            sequence: 0,
            state: SessionState::Closed,
            client_info: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Capabilities from the last successful GET_CLIENT_INFO.
    pub fn client_info(&self) -> Option<&ClientInfo> {
        self.client_info.as_ref()
    }

    /// Open the transport. Must precede every other operation.
    pub fn open(&mut self) -> Result<(), MdfuError> {
        self.transport.open()?;
        self.sequence = 0;
        self.client_info = None;
        self.state = SessionState::Open;
        Ok(())
    }

    /// Close the transport. Safe to call on an already closed session.
    pub fn close(&mut self) -> Result<(), MdfuError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.state = SessionState::Closed;
        self.transport.close()?;
        Ok(())
    }

    /// Response timeout for one command, from client info when known.
    fn command_timeout(&self, command: Command) -> Duration {
        match &self.client_info {
            Some(info) => info.command_timeout(command),
            None => BOOTSTRAP_CMD_TIMEOUT,
        }
    }

    /// One command/response exchange with retries.
    ///
    /// A resend response repeats the attempt with the same sequence number;
    /// any terminal response, success or not, advances the sequence.
    fn send_cmd(&mut self, mut packet: CommandPacket) -> Result<StatusPacket, MdfuError> {
        let timeout = self.command_timeout(packet.command);
        if packet.sync {
            self.sequence = 0;
        }
        packet.sequence = self.sequence;
        let frame = packet.encode();

        debug!(
            sequence = packet.sequence,
            command = %packet.command,
            sync = packet.sync,
            data_size = packet.data.len(),
            "sending MDFU command packet"
        );

        for attempt in 1..=self.retries {
            if let Err(e) = self.transport.write(&frame) {
                debug!(attempt, error = %e, "transport write failed");
                continue;
            }
            let bytes = match self.transport.read(timeout) {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!(attempt, error = %e, "transport read failed");
                    continue;
                }
            };
            let status = StatusPacket::decode(&bytes)?;
            debug!(
                sequence = status.sequence,
                status = %status.status,
                resend = status.resend,
                data = hex(&status.data),
                "received MDFU status packet"
            );

            if status.resend {
                debug!(
                    sequence = status.sequence,
                    "client requested resending MDFU packet"
                );
                continue;
            }

            self.sequence = (self.sequence + 1) & HEADER_SEQUENCE;

            if status.status != Status::Success {
                return Err(self.terminal_status(status));
            }
            return Ok(status);
        }

        error!(
            "tried {} times to send {} without success",
            self.retries, packet.command
        );
        Err(MdfuError::RetriesExhausted {
            attempts: self.retries,
        })
    }

    /// Turn a non-success status into an error, logging the cause the
    /// client attached where the protocol defines one.
    fn terminal_status(&self, status: StatusPacket) -> MdfuError {
        error!("received MDFU status packet with {}", status.status);

        let cause = match status.status {
            Status::NotExecuted | Status::AbortFileTransfer => status.data.first().copied(),
            _ => None,
        };
        if let Some(byte) = cause {
            match cause_description(status.status, byte) {
                Some(text) => error!("cause: {text}"),
                None => error!("invalid cause {byte} for status \"{}\"", status.status),
            }
        }
        MdfuError::Protocol {
            status: status.status,
            cause,
        }
    }

    /// Retrieve and decode the client capability block.
    ///
    /// This is the synchronizing exchange: the sequence counter restarts at
    /// zero and the transport is paced conservatively until the decoded
    /// inter-transaction delay replaces the bootstrap value.
    pub fn get_client_info(&mut self) -> Result<ClientInfo, MdfuError> {
        self.transport.ioctl(Ioctl::InterTransactionDelay(
            BOOTSTRAP_INTER_TRANSACTION_DELAY,
        ))?;

        let status = self.send_cmd(CommandPacket::new(Command::GetClientInfo, true, Vec::new()))?;
        let info = ClientInfo::decode(&status.data)?;
        debug!(version = %info.version, buffer_size = info.buffer_size, "decoded client info");

        self.client_info = Some(info.clone());
        if self.state == SessionState::Open {
            self.state = SessionState::ClientKnown;
        }
        Ok(info)
    }

    /// Run the complete firmware update workflow.
    ///
    /// Discovery, transfer and finalization happen in strict order; any
    /// terminal error tears the session down before surfacing.
    pub fn run_update(&mut self, image: &mut dyn ImageReader) -> Result<(), MdfuError> {
        let result = self.update_inner(image);
        if result.is_err() {
            // The session is unusable after a fatal mid-transfer error.
            self.state = SessionState::Closed;
            if let Err(e) = self.transport.close() {
                debug!(error = %e, "transport close failed after update error");
            }
        }
        result
    }

    fn update_inner(&mut self, image: &mut dyn ImageReader) -> Result<(), MdfuError> {
        self.observer.on_event(&MdfuEvent::Phase {
            phase: UpdatePhase::Discovery,
        });

        let info = self.get_client_info()?;
        if info.version.is_newer_than_host() {
            error!(
                "MDFU client protocol version {} not supported. This MDFU host implements \
                 MDFU protocol version {}. Please update the host to the latest version.",
                info.version, PROTOCOL_VERSION
            );
            return Err(MdfuError::VersionMismatch {
                client: info.version,
                host: PROTOCOL_VERSION,
            });
        }
        if info.buffer_size as usize > MAX_COMMAND_DATA_LENGTH {
            error!(
                "MDFU host protocol buffers are configured for a maximum command data length \
                 of {} but the client requires {}",
                MAX_COMMAND_DATA_LENGTH, info.buffer_size
            );
            return Err(MdfuError::BufferTooLarge {
                required: info.buffer_size,
                max: MAX_COMMAND_DATA_LENGTH,
            });
        }
        self.transport
            .ioctl(Ioctl::InterTransactionDelay(info.inter_transaction_delay))?;

        self.send_cmd(CommandPacket::new(Command::StartTransfer, false, Vec::new()))?;
        self.state = SessionState::Transferring;
        self.observer.on_event(&MdfuEvent::Phase {
            phase: UpdatePhase::Transfer,
        });

        let chunk_size = info.buffer_size as usize;
        let mut chunk = vec![0u8; chunk_size];
        let mut sent: u64 = 0;
        loop {
            let count = image.read(&mut chunk)?;
            if count == 0 {
                break;
            }
            self.send_cmd(CommandPacket::new(
                Command::WriteChunk,
                false,
                chunk[..count].to_vec(),
            ))?;
            sent += count as u64;
            self.observer.on_event(&MdfuEvent::Progress { sent });
            // The final chunk of the image comes back short.
            if count < chunk_size {
                break;
            }
        }
        info!(bytes = sent, "image transfer finished");

        self.state = SessionState::Finalizing;
        self.observer.on_event(&MdfuEvent::Phase {
            phase: UpdatePhase::Finalize,
        });

        let status = self.send_cmd(CommandPacket::new(
            Command::GetImageState,
            false,
            Vec::new(),
        ))?;
        let image_state = status.data.first().copied().unwrap_or(0);
        if image_state != IMAGE_STATE_VALID {
            error!("image state {image_state} is invalid");
            return Err(MdfuError::ImageRejected(image_state));
        }

        self.send_cmd(CommandPacket::new(Command::EndTransfer, false, Vec::new()))?;
        self.observer.on_event(&MdfuEvent::Complete);
        Ok(())
    }

    /// Ask the client to switch operating mode.
    pub fn run_change_mode(&mut self) -> Result<(), MdfuError> {
        self.send_cmd(CommandPacket::new(Command::ChangeMode, false, Vec::new()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::image::MemoryImageReader;
    use crate::transport::MockTransport;

    /// Capability block: buffer size 2, one buffer, version 1.0.0, default
    /// timeout 10 ticks, no inter-transaction delay.
    fn client_info_payload() -> Vec<u8> {
        vec![
            0x02, 0x03, 0x02, 0x00, 0x01, // buffer info
            0x01, 0x03, 0x01, 0x00, 0x00, // protocol version 1.0.0
            0x03, 0x03, 0x00, 0x0A, 0x00, // default timeout
            0x04, 0x04, 0x00, 0x00, 0x00, 0x00, // inter transaction delay
        ]
    }

    fn success(sequence: u8, data: Vec<u8>) -> StatusPacket {
        StatusPacket::new(Status::Success, false, sequence, data)
    }

    fn session(transport: &MockTransport, retries: u32) -> MdfuSession<NullObserver> {
        MdfuSession::with_observer(Box::new(transport.clone()), retries, Arc::new(NullObserver))
    }

    #[test]
    fn update_drives_the_full_command_sequence() {
        let transport = MockTransport::new();
        transport.queue_status(&success(0, client_info_payload()));
        for sequence in 1..=3 {
            transport.queue_status(&success(sequence, vec![]));
        }
        transport.queue_status(&success(4, vec![IMAGE_STATE_VALID]));
        transport.queue_status(&success(5, vec![]));

        let mut session = session(&transport, 2);
        session.open().unwrap();
        let mut image = MemoryImageReader::new(vec![0x00, 0x01, 0x02, 0x03]);
        session.run_update(&mut image).unwrap();

        // Spec wire trace: sync discovery at sequence 0, then one command
        // per step, two-byte chunks as advertised by the client.
        assert_eq!(
            transport.writes(),
            vec![
                vec![0x80, 0x01],
                vec![0x01, 0x02],
                vec![0x02, 0x03, 0x00, 0x01],
                vec![0x03, 0x03, 0x02, 0x03],
                vec![0x04, 0x04],
                vec![0x05, 0x05],
            ]
        );
        // Bootstrap pacing first, then the client's advertised delay.
        assert_eq!(
            transport.delays(),
            vec![Duration::from_millis(10), Duration::ZERO]
        );
    }

    #[test]
    fn resend_reuses_the_sequence_number() {
        let transport = MockTransport::new();
        transport.queue_status(&StatusPacket::new(Status::Success, true, 7, vec![]));
        transport.queue_status(&success(7, vec![]));

        let mut session = session(&transport, 3);
        session.sequence = 7;
        session
            .send_cmd(CommandPacket::new(
                Command::WriteChunk,
                false,
                vec![0xAA, 0xBB],
            ))
            .unwrap();

        let writes = transport.writes();
        assert_eq!(writes.len(), 2);
        // Identical retransmission, same sequence number.
        assert_eq!(writes[0], writes[1]);
        assert_eq!(writes[0][0] & HEADER_SEQUENCE, 7);
        // Only the terminal response consumed a sequence number.
        assert_eq!(session.sequence, 8);
    }

    #[test]
    fn sequence_wraps_modulo_32() {
        let transport = MockTransport::new();
        transport.queue_status(&success(31, vec![]));

        let mut session = session(&transport, 2);
        session.sequence = 31;
        session
            .send_cmd(CommandPacket::new(Command::StartTransfer, false, vec![]))
            .unwrap();
        assert_eq!(session.sequence, 0);
    }

    #[test]
    fn transport_errors_are_retried_until_exhaustion() {
        let transport = MockTransport::new();
        transport.queue_read_error(TransportError::ChecksumMismatch {
            calculated: 0x1234,
            received: 0x1235,
        });
        transport.queue_read_error(TransportError::ChecksumMismatch {
            calculated: 0x1234,
            received: 0x1235,
        });

        let mut session = session(&transport, 2);
        let result = session.send_cmd(CommandPacket::new(Command::StartTransfer, false, vec![]));
        assert!(matches!(
            result,
            Err(MdfuError::RetriesExhausted { attempts: 2 })
        ));
        // One write per attempt, never more than the retry cap.
        assert_eq!(transport.writes().len(), 2);
    }

    #[test]
    fn failed_writes_count_as_attempts() {
        let transport = MockTransport::new();
        transport.fail_writes(1);
        transport.queue_status(&success(0, vec![]));

        let mut session = session(&transport, 2);
        session
            .send_cmd(CommandPacket::new(Command::StartTransfer, false, vec![]))
            .unwrap();
        assert_eq!(transport.writes().len(), 1);
    }

    #[test]
    fn non_success_status_advances_the_sequence() {
        let transport = MockTransport::new();
        transport.queue_status(&StatusPacket::new(Status::NotSupported, false, 0, vec![]));

        let mut session = session(&transport, 2);
        let result = session.send_cmd(CommandPacket::new(Command::StartTransfer, false, vec![]));
        assert!(matches!(
            result,
            Err(MdfuError::Protocol {
                status: Status::NotSupported,
                cause: None,
            })
        ));
        assert_eq!(session.sequence, 1);
    }

    #[test]
    fn not_executed_status_carries_its_cause() {
        let transport = MockTransport::new();
        transport.queue_status(&StatusPacket::new(
            Status::NotExecuted,
            false,
            0,
            vec![0x03],
        ));

        let mut session = session(&transport, 2);
        let result = session.send_cmd(CommandPacket::new(Command::WriteChunk, false, vec![0x00]));
        assert!(matches!(
            result,
            Err(MdfuError::Protocol {
                status: Status::NotExecuted,
                cause: Some(0x03),
            })
        ));
    }

    #[test]
    fn invalid_status_code_is_terminal() {
        let transport = MockTransport::new();
        transport.queue_read(vec![0x00, 0x09]);
        transport.queue_status(&success(0, vec![]));

        let mut session = session(&transport, 5);
        let result = session.send_cmd(CommandPacket::new(Command::StartTransfer, false, vec![]));
        assert!(matches!(
            result,
            Err(MdfuError::Packet(PacketError::InvalidStatus(9)))
        ));
        // No retry after a protocol breach.
        assert_eq!(transport.writes().len(), 1);
    }

    #[test]
    fn newer_client_version_is_rejected_before_transfer() {
        let transport = MockTransport::new();
        transport.queue_status(&success(
            0,
            vec![
                0x02, 0x03, 0x02, 0x00, 0x01, // buffer info
                0x01, 0x03, 0x02, 0x00, 0x00, // protocol version 2.0.0
            ],
        ));

        let mut session = session(&transport, 2);
        session.open().unwrap();
        let mut image = MemoryImageReader::new(vec![0x00]);
        let result = session.run_update(&mut image);
        assert!(matches!(result, Err(MdfuError::VersionMismatch { .. })));
        // Discovery was the only exchange on the wire.
        assert_eq!(transport.writes().len(), 1);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn oversized_client_buffer_is_rejected() {
        let transport = MockTransport::new();
        transport.queue_status(&success(
            0,
            vec![
                0x02, 0x03, 0x01, 0x08, 0x01, // buffer size 0x0801 = 2049
                0x01, 0x03, 0x01, 0x00, 0x00,
            ],
        ));

        let mut session = session(&transport, 2);
        session.open().unwrap();
        let mut image = MemoryImageReader::new(vec![0x00]);
        let result = session.run_update(&mut image);
        assert!(matches!(
            result,
            Err(MdfuError::BufferTooLarge { required: 2049, .. })
        ));
    }

    #[test]
    fn invalid_image_state_fails_the_update() {
        let transport = MockTransport::new();
        transport.queue_status(&success(0, client_info_payload()));
        transport.queue_status(&success(1, vec![]));
        transport.queue_status(&success(2, vec![]));
        transport.queue_status(&success(3, vec![0x02]));

        let mut session = session(&transport, 2);
        session.open().unwrap();
        let mut image = MemoryImageReader::new(vec![0x00, 0x01]);
        let result = session.run_update(&mut image);
        assert!(matches!(result, Err(MdfuError::ImageRejected(0x02))));
    }

    #[test]
    fn empty_image_sends_no_chunks() {
        let transport = MockTransport::new();
        transport.queue_status(&success(0, client_info_payload()));
        transport.queue_status(&success(1, vec![]));
        transport.queue_status(&success(2, vec![IMAGE_STATE_VALID]));
        transport.queue_status(&success(3, vec![]));

        let mut session = session(&transport, 2);
        session.open().unwrap();
        let mut image = MemoryImageReader::new(Vec::new());
        session.run_update(&mut image).unwrap();

        let commands: Vec<u8> = transport.writes().iter().map(|w| w[1]).collect();
        assert_eq!(commands, [0x01, 0x02, 0x04, 0x05]);
    }

    #[test]
    fn change_mode_is_one_exchange() {
        let transport = MockTransport::new();
        transport.queue_status(&success(0, vec![]));

        let mut session = session(&transport, 2);
        session.open().unwrap();
        session.run_change_mode().unwrap();
        assert_eq!(transport.writes(), vec![vec![0x00, 0x06]]);
    }

    #[test]
    fn close_is_idempotent() {
        let transport = MockTransport::new();
        let mut session = session(&transport, 2);
        session.open().unwrap();
        assert!(transport.is_open());
        session.close().unwrap();
        assert!(!transport.is_open());
        session.close().unwrap();
    }
}
