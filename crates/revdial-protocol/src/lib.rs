//! revdial-protocol: Wire protocol for revdial connection multiplexing
//!
//! This crate defines the binary frames exchanged between a server and its
//! agents over a single WebSocket. Every frame addresses one logical
//! connection by [`ConnId`] and carries one [`Message`].

pub mod codec;
pub mod conn_id;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{Frame, FrameCodec};
pub use conn_id::ConnId;
pub use error::ProtocolError;
pub use frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{Message, MessageType, EOF_MESSAGE};
