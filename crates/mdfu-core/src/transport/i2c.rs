//! Polled I²C transport.
//!
//! Same retrieval pattern as SPI but half duplex: the command is a plain
//! bus write, and responses are fetched with bus reads. A busy client
//! either NAKs the write (detected later through the response poll timing
//! out) or answers polls with frames that carry neither the length nor the
//! response type byte.

use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, trace};

use super::{Ioctl, ItdGate, Transport, TransportError};
use crate::checksum::crc16;
use crate::mac::Mac;
use crate::protocol::constants::{CMD_PACKET_MAX_SIZE, RSP_PACKET_MAX_SIZE};
use crate::protocol::hex;
use crate::timeout::Deadline;

/// First byte of a length announcement frame.
const FRAME_TYPE_LENGTH: u8 = b'L';
/// First byte of a response frame.
const FRAME_TYPE_RESPONSE: u8 = b'R';

const FRAME_TYPE_SIZE: usize = 1;
const LENGTH_FIELD_SIZE: usize = 2;
const FRAME_CHECKSUM_SIZE: usize = 2;

/// Type byte, little-endian length, checksum over the length field.
const LENGTH_FRAME_SIZE: usize = FRAME_TYPE_SIZE + LENGTH_FIELD_SIZE + FRAME_CHECKSUM_SIZE;

/// Largest command frame: packet plus checksum.
const FRAME_BUFFER_MAX_SIZE: usize = CMD_PACKET_MAX_SIZE + FRAME_CHECKSUM_SIZE;

/// Polled I²C transport over a half-duplex MAC.
pub struct I2cTransport<M: Mac> {
    mac: M,
    itd: ItdGate,
}

impl<M: Mac> I2cTransport<M> {
    pub fn new(mac: M) -> Self {
        Self {
            mac,
            itd: ItdGate::new(),
        }
    }

    /// One paced bus read into `buf`.
    fn bus_read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.itd.wait();
        let result = self.mac.read(buf);
        self.itd.rearm();
        Ok(result?)
    }

    /// Poll length announcement frames until the client produces one.
    fn poll_for_response_length(&mut self, deadline: &Deadline) -> Result<usize, TransportError> {
        let mut frame = [0u8; LENGTH_FRAME_SIZE];
        loop {
            let count = self.bus_read(&mut frame)?;
            trace!(frame = hex(&frame[..count]), "I2C length poll");
            if count == LENGTH_FRAME_SIZE && frame[0] == FRAME_TYPE_LENGTH {
                let length = LittleEndian::read_u16(&frame[1..3]) as usize;
                let received = LittleEndian::read_u16(&frame[3..5]);
                let calculated = crc16(&frame[1..3]);
                if calculated != received {
                    debug!("I2C transport length frame checksum mismatch");
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

impl<M: Mac> Transport for I2cTransport<M> {
    fn open(&mut self) -> Result<(), TransportError> {
        Ok(self.mac.open()?)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        Ok(self.mac.close()?)
    }

    fn write(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        if packet.len() + FRAME_CHECKSUM_SIZE > FRAME_BUFFER_MAX_SIZE {
            return Err(TransportError::OversizeCommand {
                size: packet.len(),
                max: CMD_PACKET_MAX_SIZE,
            });
        }
        let mut frame = Vec::with_capacity(packet.len() + FRAME_CHECKSUM_SIZE);
        frame.extend_from_slice(packet);
        frame.extend_from_slice(&crc16(packet).to_le_bytes());
        trace!(frame = hex(&frame), "I2C transport sending frame");

        self.itd.wait();
        // A busy client NAKs the transfer; swallow the failure and let the
        // response poll decide whether anything actually arrived.
        if let Err(e) = self.mac.write(&frame) {
            debug!(error = %e, "I2C write was not acknowledged");
        }
        self.itd.rearm();
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let deadline = Deadline::after(timeout);

        debug!("start client response polling");
        let length = self.poll_for_response_length(&deadline)?;

        let mut frame = vec![0u8; FRAME_TYPE_SIZE + length];
        loop {
            let count = self.bus_read(&mut frame)?;
            trace!(frame = hex(&frame[..count]), "I2C response poll");
            if count == frame.len() && frame[0] == FRAME_TYPE_RESPONSE {
                let payload_size = length - FRAME_CHECKSUM_SIZE;
                let payload = &frame[FRAME_TYPE_SIZE..FRAME_TYPE_SIZE + payload_size];
                let received = LittleEndian::read_u16(&frame[FRAME_TYPE_SIZE + payload_size..]);
                let calculated = crc16(payload);
                if calculated != received {
                    debug!("I2C transport response frame checksum mismatch");
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
                debug!(delay_us = delay.as_micros() as u64, "I2C inter transaction delay updated");
                self.itd.set_delay(delay);
                Ok(())
            }
        }
    }
}
