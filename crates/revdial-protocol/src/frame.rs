//! Frame header layout
//!
//! ```text
//!  0                   8      9           12
//! +-------------------+------+------------+----------------+
//! | conn id (u64, BE) | kind | len (u24)  | bincode payload |
//! +-------------------+------+------------+----------------+
//! ```

use crate::conn_id::ConnId;
use crate::error::ProtocolError;
use crate::message::MessageType;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 12;

/// Largest payload the 24-bit length field can describe
pub const MAX_PAYLOAD_SIZE: usize = 0x00FF_FFFF;

/// Routing and length information in front of every payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Logical connection the payload belongs to
    pub conn_id: ConnId,
    /// Kind of message in the payload
    pub message_type: MessageType,
    /// Payload length in bytes
    pub payload_length: u32,
}

impl FrameHeader {
    /// Create a new frame header
    pub fn new(conn_id: ConnId, message_type: MessageType, payload_length: u32) -> Self {
        Self {
            conn_id,
            message_type,
            payload_length,
        }
    }

    /// Wire form of the header
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..8].copy_from_slice(&self.conn_id.as_u64().to_be_bytes());
        out[8] = self.message_type.as_u8();
        out[9..].copy_from_slice(&self.payload_length.to_be_bytes()[1..]);
        out
    }

    /// Read a header from the front of `src` without consuming it.
    ///
    /// `Ok(None)` when fewer than [`HEADER_SIZE`] bytes are available.
    pub fn parse(src: &[u8]) -> Result<Option<Self>, ProtocolError> {
        let Some(raw) = src.get(..HEADER_SIZE) else {
            return Ok(None);
        };

        let message_type =
            MessageType::from_u8(raw[8]).ok_or(ProtocolError::UnknownMessageType(raw[8]))?;

        let mut id = [0u8; 8];
        id.copy_from_slice(&raw[..8]);
        let payload_length = u32::from_be_bytes([0, raw[9], raw[10], raw[11]]);

        Ok(Some(Self {
            conn_id: ConnId::new(u64::from_be_bytes(id)),
            message_type,
            payload_length,
        }))
    }
}
