//! Message types for the revdial protocol
//!
//! A [`Message`] is the only thing ever written to the physical socket. It
//! is wrapped in a [`Frame`](crate::Frame) that names the logical
//! connection it belongs to.
//!
//! # Message Flow
//!
//! 1. The dialing side allocates a conn id and sends `Connect`
//! 2. The remote side dials the requested address and starts piping
//! 3. `Data` messages flow in both directions
//! 4. Either side ends the connection with `Error`; the text `"EOF"`
//!    marks an orderly close

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Error text used to signal an orderly close of a logical connection
pub const EOF_MESSAGE: &str = "EOF";

/// Message type identifier carried in the frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Stream payload bytes
    Data = 0x01,
    /// Request to dial `proto`/`address` on the receiver's side
    Connect = 0x02,
    /// Terminal error or close for one logical connection
    Error = 0x03,
}

impl MessageType {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Data),
            0x02 => Some(Self::Connect),
            0x03 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Protocol messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Raw stream bytes for one logical connection
    Data(Bytes),

    /// Dial request
    Connect {
        /// Network, e.g. `tcp` or `unix`
        proto: String,
        /// Address understood by the receiver's dialer
        address: String,
    },

    /// Error or close
    Error {
        /// Human readable reason, `"EOF"` for an orderly close
        message: String,
    },
}

impl Message {
    /// Get the message type
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Data(_) => MessageType::Data,
            Message::Connect { .. } => MessageType::Connect,
            Message::Error { .. } => MessageType::Error,
        }
    }

    /// Build a dial request
    pub fn connect(proto: impl Into<String>, address: impl Into<String>) -> Self {
        Message::Connect {
            proto: proto.into(),
            address: address.into(),
        }
    }

    /// Build an error message
    pub fn error(message: impl Into<String>) -> Self {
        Message::Error {
            message: message.into(),
        }
    }

    /// Build an orderly close message
    pub fn eof() -> Self {
        Self::error(EOF_MESSAGE)
    }

    /// Whether this is an orderly close
    pub fn is_eof(&self) -> bool {
        matches!(self, Message::Error { message } if message == EOF_MESSAGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_mapping() {
        for ty in [MessageType::Data, MessageType::Connect, MessageType::Error] {
            assert_eq!(MessageType::from_u8(ty.as_u8()), Some(ty));
        }
        assert_eq!(MessageType::from_u8(0x00), None);
        assert_eq!(MessageType::from_u8(0xFF), None);
    }

    #[test]
    fn test_message_type_of_variants() {
        assert_eq!(
            Message::Data(Bytes::from_static(b"x")).message_type(),
            MessageType::Data
        );
        assert_eq!(
            Message::connect("tcp", "10.0.0.5:80").message_type(),
            MessageType::Connect
        );
        assert_eq!(Message::eof().message_type(), MessageType::Error);
    }

    #[test]
    fn test_eof_detection() {
        assert!(Message::eof().is_eof());
        assert!(!Message::error("connection refused").is_eof());
        assert!(!Message::Data(Bytes::from_static(b"EOF")).is_eof());
    }
}
