//! Polled SPI transport.
//!
//! SPI is full duplex: every host byte clocks out one client byte, and the
//! client answers on its own schedule. Commands go out as a typed frame;
//! responses are retrieved by clocking out fill bytes and inspecting what
//! comes back, first for a length announcement, then for the response
//! itself. Anything without a recognized prefix means the client is still
//! busy.

use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, trace};

use super::{Ioctl, ItdGate, Transport, TransportError};
use crate::checksum::crc16;
use crate::mac::Mac;
use crate::protocol::constants::{CMD_PACKET_MAX_SIZE, RSP_PACKET_MAX_SIZE};
use crate::protocol::hex;
use crate::timeout::Deadline;

/// First byte of a command frame.
const FRAME_TYPE_CMD: u8 = 0x11;
/// First byte of a response retrieval frame.
const FRAME_TYPE_RSP_RETRIEVAL: u8 = 0x55;

/// The client prefixes a length announcement with these bytes.
const LENGTH_PREFIX: &[u8; 3] = b"LEN";
/// The client prefixes a retrieved response with these bytes.
const RESPONSE_PREFIX: &[u8; 3] = b"RSP";

/// Frame type byte plus the three prefix characters.
const PREFIX_SIZE: usize = 4;
const LENGTH_FIELD_SIZE: usize = 2;
const FRAME_CHECKSUM_SIZE: usize = 2;

/// Largest command frame: type byte, packet, checksum.
const FRAME_BUFFER_MAX_SIZE: usize = 1 + CMD_PACKET_MAX_SIZE + FRAME_CHECKSUM_SIZE;

/// Polled SPI transport over a full-duplex MAC.
pub struct SpiTransport<M: Mac> {
    mac: M,
    itd: ItdGate,
}

impl<M: Mac> SpiTransport<M> {
    pub fn new(mac: M) -> Self {
        Self {
            mac,
            itd: ItdGate::new(),
        }
    }

    /// One full-duplex exchange, paced by the inter-transaction delay.
    fn transfer(&mut self, tx: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut rx = vec![0u8; tx.len()];
        self.itd.wait();
        let result = self.mac.exchange(tx, &mut rx);
        self.itd.rearm();
        result?;
        trace!(tx = hex(tx), rx = hex(&rx), "SPI exchange");
        Ok(rx)
    }

    /// Build a retrieval frame that clocks out `payload_size` bytes past
    /// the prefix. The fill bytes are don't-care; zero reads better in bus
    /// traces.
    fn retrieval_frame(payload_size: usize) -> Vec<u8> {
        let mut frame = vec![0u8; PREFIX_SIZE + payload_size];
        frame[0] = FRAME_TYPE_RSP_RETRIEVAL;
        frame
    }

    /// Clock out retrieval frames until the client announces a response
    /// length. The announced length covers the response packet plus its
    /// checksum.
    fn poll_for_response_length(&mut self, deadline: &Deadline) -> Result<usize, TransportError> {
        loop {
            let rx = self.transfer(&Self::retrieval_frame(
                LENGTH_FIELD_SIZE + FRAME_CHECKSUM_SIZE,
            ))?;
            if &rx[1..PREFIX_SIZE] == LENGTH_PREFIX {
                let length = LittleEndian::read_u16(&rx[4..6]) as usize;
                let received = LittleEndian::read_u16(&rx[6..8]);
                let calculated = crc16(&rx[4..6]);
                if calculated != received {
                    debug!("SPI transport length frame checksum mismatch");
                    return Err(TransportError::ChecksumMismatch {
                        calculated,
                        received,
                    });
                }
                if length < FRAME_CHECKSUM_SIZE {
                    return Err(TransportError::ShortResponse(length));
                }
                if length - FRAME_CHECKSUM_SIZE > RSP_PACKET_MAX_SIZE {
                    return Err(TransportError::OversizeResponse {
                        size: length - FRAME_CHECKSUM_SIZE,
                        max: RSP_PACKET_MAX_SIZE,
                    });
                }
                return Ok(length);
            }
            debug!("received no response from client");
            if deadline.expired() {
                return Err(TransportError::Timeout);
            }
        }
    }
}

impl<M: Mac> Transport for SpiTransport<M> {
    fn open(&mut self) -> Result<(), TransportError> {
        Ok(self.mac.open()?)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        Ok(self.mac.close()?)
    }

    fn write(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        if 1 + packet.len() + FRAME_CHECKSUM_SIZE > FRAME_BUFFER_MAX_SIZE {
            return Err(TransportError::OversizeCommand {
                size: packet.len(),
                max: CMD_PACKET_MAX_SIZE,
            });
        }
        let mut frame = Vec::with_capacity(1 + packet.len() + FRAME_CHECKSUM_SIZE);
        frame.push(FRAME_TYPE_CMD);
        frame.extend_from_slice(packet);
        frame.extend_from_slice(&crc16(packet).to_le_bytes());

        // The bytes the client clocks back during a command are meaningless.
        self.transfer(&frame)?;
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Deadline::after(timeout);

        debug!("start client response polling");
        let length = self.poll_for_response_length(&deadline)?;

        loop {
            let rx = self.transfer(&Self::retrieval_frame(length))?;
            if &rx[1..PREFIX_SIZE] == RESPONSE_PREFIX {
                let payload_size = length - FRAME_CHECKSUM_SIZE;
                let payload = &rx[PREFIX_SIZE..PREFIX_SIZE + payload_size];
                let received =
                    LittleEndian::read_u16(&rx[PREFIX_SIZE + payload_size..PREFIX_SIZE + length]);
                let calculated = crc16(payload);
                if calculated != received {
                    debug!("SPI transport response frame checksum mismatch");
                    return Err(TransportError::ChecksumMismatch {
                        calculated,
                        received,
                    });
                }
                return Ok(payload.to_vec());
            }
            debug!("client response not ready yet");
            if deadline.expired() {
                return Err(TransportError::Timeout);
            }
        }
    }

    fn ioctl(&mut self, request: Ioctl) -> Result<(), TransportError> {
        match request {
            Ioctl::InterTransactionDelay(delay) => {
                debug!(delay_us = delay.as_micros() as u64, "SPI inter transaction delay updated");
                self.itd.set_delay(delay);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::MockMac;
    use std::time::Instant;

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn length_frame(length: u16) -> Vec<u8> {
        let mut frame = vec![0x00];
        frame.extend_from_slice(LENGTH_PREFIX);
        frame.extend_from_slice(&length.to_le_bytes());
        frame.extend_from_slice(&crc16(&length.to_le_bytes()).to_le_bytes());
        frame
    }

    fn response_frame(payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x00];
        frame.extend_from_slice(RESPONSE_PREFIX);
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&crc16(payload).to_le_bytes());
        frame
    }

    #[test]
    fn command_frame_layout() {
        let mac = MockMac::new();
        let mut transport = SpiTransport::new(mac.clone());

        transport.write(&[0x00, 0x02]).unwrap();
        let writes = mac.writes();
        assert_eq!(writes.len(), 1);
        let fcs = crc16(&[0x00, 0x02]).to_le_bytes();
        assert_eq!(writes[0], [0x11, 0x00, 0x02, fcs[0], fcs[1]]);
    }

    #[test]
    fn read_retrieves_announced_response() {
        let payload = [0x01, 0x01, 0x2A];
        let mac = MockMac::new();
        mac.queue_exchange(&length_frame(payload.len() as u16 + 2));
        mac.queue_exchange(&response_frame(&payload));
        let mut transport = SpiTransport::new(mac.clone());

        assert_eq!(transport.read(TIMEOUT).unwrap(), payload);

        // Length poll clocks 8 bytes, response poll 4 + length.
        let writes = mac.writes();
        assert_eq!(writes[0].len(), 8);
        assert_eq!(writes[0][0], FRAME_TYPE_RSP_RETRIEVAL);
        assert_eq!(writes[1].len(), PREFIX_SIZE + payload.len() + 2);
        assert_eq!(writes[1][0], FRAME_TYPE_RSP_RETRIEVAL);
    }

    #[test]
    fn busy_frames_are_polled_through_with_itd_pacing() {
        let itd = Duration::from_micros(100);
        let payload = [0x00, 0x01];
        let mac = MockMac::new();
        for _ in 0..3 {
            mac.queue_exchange(&[0u8; 8]);
        }
        mac.queue_exchange(&length_frame(payload.len() as u16 + 2));
        mac.queue_exchange(&response_frame(&payload));
        let mut transport = SpiTransport::new(mac.clone());
        transport
            .ioctl(Ioctl::InterTransactionDelay(itd))
            .unwrap();

        let start = Instant::now();
        assert_eq!(transport.read(TIMEOUT).unwrap(), payload);

        // Three busy polls before the length frame: at least three full
        // delays between the five exchange start times.
        assert!(start.elapsed() >= 3 * itd);
        assert_eq!(mac.writes().len(), 5);
    }

    #[test]
    fn smallest_legal_length_announcement_succeeds() {
        // Length 2 is checksum-only: an empty response payload.
        let mac = MockMac::new();
        mac.queue_exchange(&length_frame(2));
        mac.queue_exchange(&response_frame(&[]));
        let mut transport = SpiTransport::new(mac);

        assert_eq!(transport.read(TIMEOUT).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn length_below_checksum_size_is_rejected() {
        let mac = MockMac::new();
        mac.queue_exchange(&length_frame(1));
        let mut transport = SpiTransport::new(mac);

        assert!(matches!(
            transport.read(TIMEOUT),
            Err(TransportError::ShortResponse(1))
        ));
    }

    #[test]
    fn oversize_length_announcement_is_rejected() {
        let mac = MockMac::new();
        mac.queue_exchange(&length_frame((RSP_PACKET_MAX_SIZE + 3) as u16));
        let mut transport = SpiTransport::new(mac);

        assert!(matches!(
            transport.read(TIMEOUT),
            Err(TransportError::OversizeResponse { .. })
        ));
    }

    #[test]
    fn corrupted_length_checksum_is_rejected() {
        let mut frame = length_frame(4);
        frame[6] ^= 0x01;
        let mac = MockMac::new();
        mac.queue_exchange(&frame);
        let mut transport = SpiTransport::new(mac);

        assert!(matches!(
            transport.read(TIMEOUT),
            Err(TransportError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn corrupted_response_checksum_is_rejected() {
        let payload = [0x01, 0x01];
        let mut rsp = response_frame(&payload);
        let last = rsp.len() - 1;
        rsp[last] ^= 0x80;
        let mac = MockMac::new();
        mac.queue_exchange(&length_frame(payload.len() as u16 + 2));
        mac.queue_exchange(&rsp);
        let mut transport = SpiTransport::new(mac);

        assert!(matches!(
            transport.read(TIMEOUT),
            Err(TransportError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn endless_busy_times_out() {
        let mac = MockMac::new();
        let mut transport = SpiTransport::new(mac);

        assert!(matches!(
            transport.read(Duration::from_millis(10)),
            Err(TransportError::Timeout)
        ));
    }
}
