//! Framed serial transport.
//!
//! Frames look like `START || escaped(packet || FCS) || END`. The three
//! reserved codes are escaped inside the payload as the escape code
//! followed by the byte's complement.

use std::time::Duration;

use tracing::{debug, trace};

use super::{Transport, TransportError};
use crate::checksum::crc16;
use crate::mac::Mac;
use crate::protocol::constants::CMD_PACKET_MAX_SIZE;
use crate::protocol::hex;
use crate::timeout::Deadline;

/// Indicates the start of a frame.
const FRAME_START_CODE: u8 = 0x56;
/// The ending byte code of a frame.
const FRAME_END_CODE: u8 = 0x9E;
/// Announces an escape sequence.
const ESCAPE_SEQ_CODE: u8 = 0xCC;

const FRAME_CHECK_SEQUENCE_SIZE: usize = 2;

/// Decoded receive limit: the largest packet plus its checksum.
const RECEIVE_BUFFER_SIZE: usize = CMD_PACKET_MAX_SIZE + FRAME_CHECK_SEQUENCE_SIZE;

/// Worst case encoded frame: every payload and checksum byte escaped, plus
/// the frame delimiters.
const SEND_BUFFER_SIZE: usize = 1 + 2 * RECEIVE_BUFFER_SIZE + 1;

fn is_reserved(byte: u8) -> bool {
    byte == FRAME_START_CODE || byte == FRAME_END_CODE || byte == ESCAPE_SEQ_CODE
}

/// Append `data` to `out`, escaping reserved codes.
fn encode_frame_payload(data: &[u8], out: &mut Vec<u8>) {
    for &byte in data {
        if is_reserved(byte) {
            out.push(ESCAPE_SEQ_CODE);
            out.push(!byte);
        } else {
            out.push(byte);
        }
    }
}

/// Serial transport over a byte-granular MAC.
///
/// Sends default to streaming the encoded bytes through the MAC as they are
/// produced; `buffered` staging assembles the whole escaped frame in a
/// session-owned scratch buffer and issues a single MAC write, which suits
/// packet-oriented links like the TCP tunnel.
pub struct SerialTransport<M: Mac> {
    mac: M,
    buffered_writes: bool,
    scratch: Vec<u8>,
}

impl<M: Mac> SerialTransport<M> {
    /// Streaming transport: frame bytes go out as they are encoded.
    pub fn new(mac: M) -> Self {
        Self {
            mac,
            buffered_writes: false,
            scratch: Vec::new(),
        }
    }

    /// Buffered transport: one MAC write per frame.
    pub fn buffered(mac: M) -> Self {
        Self {
            mac,
            buffered_writes: true,
            scratch: Vec::with_capacity(SEND_BUFFER_SIZE),
        }
    }

    /// Discard incoming bytes until the frame start code or the deadline.
    fn discard_until_start(&mut self, deadline: &Deadline) -> Result<(), TransportError> {
        let mut byte = [0u8; 1];
        loop {
            if self.mac.read(&mut byte)? == 1 && byte[0] == FRAME_START_CODE {
                return Ok(());
            }
            if deadline.expired() {
                debug!("timeout expired while waiting for frame start code");
                return Err(TransportError::Timeout);
            }
        }
    }

    /// Accumulate decoded payload bytes until the frame end code.
    ///
    /// Escapes are resolved on the fly, so the escape state survives
    /// arbitrarily split MAC reads.
    fn read_frame(&mut self, deadline: &Deadline) -> Result<Vec<u8>, TransportError> {
        let mut payload = Vec::with_capacity(64);
        let mut escaped = false;
        let mut byte = [0u8; 1];

        loop {
            if self.mac.read(&mut byte)? == 1 {
                let code = byte[0];
                if code == FRAME_END_CODE {
                    return Ok(payload);
                }
                let decoded = if escaped {
                    let original = !code;
                    if !is_reserved(original) {
                        debug!(code = format!("0x{code:02x}"), "invalid code after escape code");
                        return Err(TransportError::InvalidEscape(code));
                    }
                    escaped = false;
                    Some(original)
                } else if code == ESCAPE_SEQ_CODE {
                    escaped = true;
                    None
                } else {
                    Some(code)
                };
                if let Some(decoded) = decoded {
                    if payload.len() == RECEIVE_BUFFER_SIZE {
                        debug!(
                            "buffer overflow in serial transport while waiting for frame end code"
                        );
                        return Err(TransportError::BufferOverflow {
                            max: RECEIVE_BUFFER_SIZE,
                        });
                    }
                    payload.push(decoded);
                }
            }
            if deadline.expired() {
                debug!("timeout expired while waiting for frame end code");
                return Err(TransportError::Timeout);
            }
        }
    }
}

impl<M: Mac> Transport for SerialTransport<M> {
    fn open(&mut self) -> Result<(), TransportError> {
        Ok(self.mac.open()?)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        Ok(self.mac.close()?)
    }

    fn write(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        if packet.len() > CMD_PACKET_MAX_SIZE {
            return Err(TransportError::OversizeCommand {
                size: packet.len(),
                max: CMD_PACKET_MAX_SIZE,
            });
        }
        let fcs = crc16(packet).to_le_bytes();
        trace!(payload = hex(packet), fcs = hex(&fcs), "sending frame");

        if self.buffered_writes {
            let mut scratch = std::mem::take(&mut self.scratch);
            scratch.clear();
            scratch.push(FRAME_START_CODE);
            encode_frame_payload(packet, &mut scratch);
            encode_frame_payload(&fcs, &mut scratch);
            scratch.push(FRAME_END_CODE);
            let result = self.mac.write(&scratch);
            self.scratch = scratch;
            result?;
        } else {
            self.mac.write(&[FRAME_START_CODE])?;
            for &byte in packet.iter().chain(&fcs) {
                if is_reserved(byte) {
                    self.mac.write(&[ESCAPE_SEQ_CODE, !byte])?;
                } else {
                    self.mac.write(&[byte])?;
                }
            }
            self.mac.write(&[FRAME_END_CODE])?;
        }
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Deadline::after(timeout);

        self.discard_until_start(&deadline)?;
        let mut payload = self.read_frame(&deadline)?;

        if payload.len() < 1 + FRAME_CHECK_SEQUENCE_SIZE {
            debug!(size = payload.len(), "received frame is too short");
            return Err(TransportError::FrameTooShort(payload.len()));
        }
        let data_size = payload.len() - FRAME_CHECK_SEQUENCE_SIZE;
        let received = u16::from_le_bytes([payload[data_size], payload[data_size + 1]]);
        let calculated = crc16(&payload[..data_size]);
        trace!(payload = hex(&payload[..data_size]), fcs = hex(&payload[data_size..]), "got a frame");

        if calculated != received {
            debug!(
                calculated = format!("0x{calculated:04x}"),
                received = format!("0x{received:04x}"),
                "frame check sequence verification failed"
            );
            return Err(TransportError::ChecksumMismatch {
                calculated,
                received,
            });
        }
        payload.truncate(data_size);
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::MockMac;

    const TIMEOUT: Duration = Duration::from_millis(50);

    /// Frame a payload the way a client would.
    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![FRAME_START_CODE];
        encode_frame_payload(payload, &mut bytes);
        encode_frame_payload(&crc16(payload).to_le_bytes(), &mut bytes);
        bytes.push(FRAME_END_CODE);
        bytes
    }

    #[test]
    fn streaming_write_escapes_and_delimits() {
        let mac = MockMac::new();
        let mut transport = SerialTransport::new(mac.clone());

        transport.write(&[0x01, 0x02]).unwrap();
        let sent: Vec<u8> = mac.writes().concat();
        // crc16([0x01, 0x02]) = !0x0201 = 0xFDFE, little endian on the wire.
        assert_eq!(sent, [0x56, 0x01, 0x02, 0xFE, 0xFD, 0x9E]);
    }

    #[test]
    fn buffered_write_is_one_mac_transaction() {
        let mac = MockMac::new();
        let mut transport = SerialTransport::buffered(mac.clone());

        transport.write(&[0x01, 0x02]).unwrap();
        let writes = mac.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0], [0x56, 0x01, 0x02, 0xFE, 0xFD, 0x9E]);
    }

    #[test]
    fn reserved_bytes_are_escaped_on_the_wire() {
        let mac = MockMac::new();
        let mut transport = SerialTransport::buffered(mac.clone());

        transport
            .write(&[FRAME_START_CODE, FRAME_END_CODE, ESCAPE_SEQ_CODE])
            .unwrap();
        let sent = mac.writes().concat();
        assert_eq!(sent[0], FRAME_START_CODE);
        assert_eq!(*sent.last().unwrap(), FRAME_END_CODE);
        // No unescaped reserved code between the delimiters.
        let mut escaped = false;
        for &byte in &sent[1..sent.len() - 1] {
            if escaped {
                escaped = false;
                continue;
            }
            assert_ne!(byte, FRAME_START_CODE);
            assert_ne!(byte, FRAME_END_CODE);
            escaped = byte == ESCAPE_SEQ_CODE;
        }
    }

    #[test]
    fn read_skips_noise_before_frame_start() {
        let mac = MockMac::new();
        mac.queue_read(&[0xAA, 0xBB]);
        mac.queue_read(&frame(&[0x05, 0x01]));
        let mut transport = SerialTransport::new(mac);

        assert_eq!(transport.read(TIMEOUT).unwrap(), [0x05, 0x01]);
    }

    #[test]
    fn reserved_bytes_round_trip() {
        let payload = [
            0x00,
            FRAME_START_CODE,
            0x11,
            FRAME_END_CODE,
            ESCAPE_SEQ_CODE,
            0xFF,
        ];
        let mac = MockMac::new();
        mac.queue_read(&frame(&payload));
        let mut transport = SerialTransport::new(mac);

        assert_eq!(transport.read(TIMEOUT).unwrap(), payload);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let mut bytes = frame(&[0x05, 0x01, 0x42]);
        let fcs_index = bytes.len() - 3;
        bytes[fcs_index] ^= 0x01;
        let mac = MockMac::new();
        mac.queue_read(&bytes);
        let mut transport = SerialTransport::new(mac);

        assert!(matches!(
            transport.read(TIMEOUT),
            Err(TransportError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn frame_shorter_than_checksum_is_rejected() {
        let mac = MockMac::new();
        mac.queue_read(&[FRAME_START_CODE, 0x01, 0x02, FRAME_END_CODE]);
        let mut transport = SerialTransport::new(mac);

        assert!(matches!(
            transport.read(TIMEOUT),
            Err(TransportError::FrameTooShort(2))
        ));
    }

    #[test]
    fn invalid_escape_sequence_is_rejected() {
        let mac = MockMac::new();
        mac.queue_read(&[FRAME_START_CODE, ESCAPE_SEQ_CODE, 0x42, FRAME_END_CODE]);
        let mut transport = SerialTransport::new(mac);

        assert!(matches!(
            transport.read(TIMEOUT),
            Err(TransportError::InvalidEscape(0x42))
        ));
    }

    #[test]
    fn silence_times_out() {
        let mac = MockMac::new();
        let mut transport = SerialTransport::new(mac);

        assert!(matches!(
            transport.read(Duration::from_millis(10)),
            Err(TransportError::Timeout)
        ));
    }

    #[test]
    fn missing_end_code_times_out() {
        let mac = MockMac::new();
        mac.queue_read(&[FRAME_START_CODE, 0x01, 0x02, 0x03]);
        let mut transport = SerialTransport::new(mac);

        assert!(matches!(
            transport.read(Duration::from_millis(10)),
            Err(TransportError::Timeout)
        ));
    }

    #[test]
    fn oversized_frame_overflows_receive_buffer() {
        let mac = MockMac::new();
        let mut bytes = vec![FRAME_START_CODE];
        bytes.extend(std::iter::repeat_n(0x01, RECEIVE_BUFFER_SIZE + 1));
        bytes.push(FRAME_END_CODE);
        mac.queue_read(&bytes);
        let mut transport = SerialTransport::new(mac);

        assert!(matches!(
            transport.read(TIMEOUT),
            Err(TransportError::BufferOverflow { .. })
        ));
    }

    #[test]
    fn host_frames_decode_back_to_the_packet() {
        // Loop the host encoder into the host decoder through the mock.
        let payload: Vec<u8> = (0..=255).collect();
        let mac = MockMac::new();
        let mut transport = SerialTransport::buffered(mac.clone());
        transport.write(&payload).unwrap();
        mac.queue_read(&mac.writes()[0]);

        assert_eq!(transport.read(TIMEOUT).unwrap(), payload);
    }

    #[test]
    fn maximum_size_packet_round_trips() {
        let payload = vec![0x9E; CMD_PACKET_MAX_SIZE];
        let mac = MockMac::new();
        let mut transport = SerialTransport::buffered(mac.clone());
        transport.write(&payload).unwrap();
        mac.queue_read(&mac.writes()[0]);

        assert_eq!(transport.read(TIMEOUT).unwrap(), payload);
    }

    #[test]
    fn oversized_packet_is_refused_before_sending() {
        let mac = MockMac::new();
        let mut transport = SerialTransport::new(mac.clone());

        let result = transport.write(&vec![0x00; CMD_PACKET_MAX_SIZE + 1]);
        assert!(matches!(
            result,
            Err(TransportError::OversizeCommand { .. })
        ));
        assert!(mac.writes().is_empty());
    }
}
