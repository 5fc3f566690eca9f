//! The 251-byte payload carried in `FILE_TRANSFER_PROTOCOL` frames.

use std::fmt;

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Size of an encoded payload: the fixed header plus the data region.
pub const PAYLOAD_SIZE: usize = 251;
/// Size of the fixed header preceding the data region.
pub const HEADER_SIZE: usize = 12;
/// Capacity of the data region.
pub const MAX_DATA_SIZE: usize = 239;

/// One FTP request or response.
///
/// All multi-byte fields are little-endian on the wire. The codec is not
/// semantic: a received `size` larger than [`MAX_DATA_SIZE`] decodes
/// faithfully and is rejected by the receive path, and unknown opcodes pass
/// through untouched.
#[derive(Clone, PartialEq, Eq)]
pub struct Payload {
    /// Request/response correlation counter, wrapping modulo 2¹⁶.
    ///
    /// Requests use strictly increasing values; the server replies with the
    /// request's value plus one.
    pub seq_number: u16,
    /// Session token issued by the server on file open; zero otherwise
    pub session: u8,
    /// Request opcode on send, [`Opcode::Ack`]/[`Opcode::Nak`] on receive
    ///
    /// [`Opcode::Ack`]: crate::Opcode::Ack
    /// [`Opcode::Nak`]: crate::Opcode::Nak
    pub opcode: u8,
    /// Valid bytes in `data`; `READ_FILE` requests reuse it as a byte count
    pub size: u8,
    /// On responses, the opcode of the request being answered
    pub req_opcode: u8,
    /// Burst mode flag; always zero here
    pub burst_complete: u8,
    /// Reserved
    pub padding: u8,
    /// Byte offset into the file, or the first entry index for listings
    pub offset: u32,
    /// Opcode-specific data region
    pub data: [u8; MAX_DATA_SIZE],
}

impl Default for Payload {
    fn default() -> Self {
        Self {
            seq_number: 0,
            session: 0,
            opcode: 0,
            size: 0,
            req_opcode: 0,
            burst_complete: 0,
            padding: 0,
            offset: 0,
            data: [0; MAX_DATA_SIZE],
        }
    }
}

impl Payload {
    /// The valid prefix of the data region.
    pub fn data(&self) -> &[u8] {
        &self.data[..(self.size as usize).min(MAX_DATA_SIZE)]
    }

    /// Copies `bytes` into the data region and stamps `size`.
    ///
    /// Senders validate lengths before framing; oversize input is truncated.
    pub fn set_data(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= MAX_DATA_SIZE);
        let len = bytes.len().min(MAX_DATA_SIZE);
        self.data[..len].copy_from_slice(&bytes[..len]);
        self.size = len as u8;
    }

    /// Serializes the payload for transmission.
    pub fn encode(&self) -> [u8; PAYLOAD_SIZE] {
        let mut out = [0; PAYLOAD_SIZE];
        let mut buf = &mut out[..];
        buf.put_u16_le(self.seq_number);
        buf.put_u8(self.session);
        buf.put_u8(self.opcode);
        buf.put_u8(self.size);
        buf.put_u8(self.req_opcode);
        buf.put_u8(self.burst_complete);
        buf.put_u8(self.padding);
        buf.put_u32_le(self.offset);
        out[HEADER_SIZE..].copy_from_slice(&self.data);
        out
    }

    /// Deserializes a payload received from the transport.
    ///
    /// MAVLink v2 strips trailing zero bytes from message payloads, so
    /// inputs shorter than [`PAYLOAD_SIZE`] are zero-extended.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() > PAYLOAD_SIZE {
            return Err(DecodeError::TooLong(bytes.len()));
        }
        let mut full = [0u8; PAYLOAD_SIZE];
        full[..bytes.len()].copy_from_slice(bytes);
        let mut buf = &full[..];
        let seq_number = buf.get_u16_le();
        let session = buf.get_u8();
        let opcode = buf.get_u8();
        let size = buf.get_u8();
        let req_opcode = buf.get_u8();
        let burst_complete = buf.get_u8();
        let padding = buf.get_u8();
        let offset = buf.get_u32_le();
        let mut data = [0u8; MAX_DATA_SIZE];
        data.copy_from_slice(buf);
        Ok(Self {
            seq_number,
            session,
            opcode,
            size,
            req_opcode,
            burst_complete,
            padding,
            offset,
            data,
        })
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("seq_number", &self.seq_number)
            .field("session", &self.session)
            .field("opcode", &self.opcode)
            .field("size", &self.size)
            .field("req_opcode", &self.req_opcode)
            .field("burst_complete", &self.burst_complete)
            .field("offset", &self.offset)
            .field("data", &self.data())
            .finish()
    }
}

/// Reasons a byte buffer is not a payload.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// More bytes than fit in one payload
    #[error("payload is {0} bytes, larger than the {PAYLOAD_SIZE} byte maximum")]
    TooLong(usize),
}
