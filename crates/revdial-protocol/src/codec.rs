//! Tokio codec for framed protocol messages

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::conn_id::ConnId;
use crate::error::ProtocolError;
use crate::frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::message::Message;

/// A complete frame with header and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Logical connection this frame belongs to
    pub conn_id: ConnId,
    /// The message payload
    pub message: Message,
}

impl Frame {
    /// Create a new frame
    pub fn new(conn_id: ConnId, message: Message) -> Self {
        Self { conn_id, message }
    }

    /// Data frame
    pub fn data(conn_id: ConnId, data: Bytes) -> Self {
        Self::new(conn_id, Message::Data(data))
    }

    /// Dial request frame
    pub fn connect(conn_id: ConnId, proto: &str, address: &str) -> Self {
        Self::new(conn_id, Message::connect(proto, address))
    }

    /// Error or close frame
    pub fn error(conn_id: ConnId, message: impl Into<String>) -> Self {
        Self::new(conn_id, Message::error(message))
    }
}

/// Codec for encoding/decoding protocol frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Current header being decoded (if any)
    pending_header: Option<FrameHeader>,
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_header: None,
        }
    }

    /// Encode a single frame into an owned buffer, one transport message's worth
    pub fn encode_frame(frame: Frame) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        FrameCodec::new().encode(frame, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode every frame contained in one transport message
    ///
    /// A message may carry several concatenated frames. Leftover bytes that
    /// do not complete a frame are an error since transport messages are
    /// never split.
    pub fn decode_all(data: &[u8]) -> Result<Vec<Frame>, ProtocolError> {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(data);
        let mut frames = Vec::new();

        while let Some(frame) = codec.decode(&mut buf)? {
            frames.push(frame);
        }

        if !buf.is_empty() || codec.pending_header.is_some() {
            let expected = codec
                .pending_header
                .map(|h| h.payload_length as usize)
                .unwrap_or(HEADER_SIZE);
            return Err(ProtocolError::IncompleteFrame {
                expected,
                actual: buf.len(),
            });
        }

        Ok(frames)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::parse(src)? {
                Some(h) => {
                    src.advance(HEADER_SIZE);
                    h
                }
                None => return Ok(None),
            },
        };

        let payload_len = header.payload_length as usize;
        if src.len() < payload_len {
            // Save header and wait for more data
            self.pending_header = Some(header);
            return Ok(None);
        }

        let payload_bytes = src.split_to(payload_len).freeze();
        let message: Message = bincode::deserialize(&payload_bytes)?;

        if message.message_type() != header.message_type {
            return Err(ProtocolError::TypeMismatch {
                header: header.message_type,
                payload: message.message_type(),
            });
        }

        tracing::trace!(
            "Decoded {:?} frame for {} ({} bytes)",
            header.message_type,
            header.conn_id,
            payload_len
        );

        Ok(Some(Frame {
            conn_id: header.conn_id,
            message,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&frame.message)?;
        let payload_len = payload.len();

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let header = FrameHeader::new(
            frame.conn_id,
            frame.message.message_type(),
            payload_len as u32,
        );
        dst.reserve(HEADER_SIZE + payload_len);
        dst.extend_from_slice(&header.to_bytes());
        dst.extend_from_slice(&payload);

        Ok(())
    }
}
