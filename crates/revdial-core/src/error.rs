//! Core error types for revdial

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use revdial_protocol::{ConnId, ProtocolError, EOF_MESSAGE};
use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::types::ClientKey;

/// Error text reported on connections of a session that went away
const CLOSED_PIPE_MESSAGE: &str = "io: read/write on closed pipe";

/// Top-level error type for revdial
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Dial error
    #[error("Dial error: {0}")]
    Dial(#[from] DialError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Session-level failures. Every one of these is terminal for the session
/// except [`SessionError::WriteTimeout`], which only fails the write that
/// ran out of time.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session has been closed
    #[error("Session closed")]
    Closed,

    /// `serve` was called a second time
    #[error("Session is already being served")]
    AlreadyServing,

    /// The peer closed the WebSocket
    #[error("Peer disconnected")]
    Disconnected,

    /// The peer reused an id that is still live
    #[error("Connection {0} already exists")]
    DuplicateConnId(ConnId),

    /// Write deadline passed
    #[error("Write deadline exceeded")]
    WriteTimeout,

    /// Nothing was received within the wait window
    #[error("No traffic for {0:?}, keepalive expired")]
    KeepaliveTimeout(Duration),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Malformed frame
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl From<SessionError> for io::Error {
    fn from(err: SessionError) -> Self {
        let kind = match &err {
            SessionError::Closed | SessionError::Disconnected => io::ErrorKind::BrokenPipe,
            SessionError::WriteTimeout | SessionError::KeepaliveTimeout(_) => {
                io::ErrorKind::TimedOut
            }
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// Failures originating a tunneled connection
#[derive(Error, Debug)]
pub enum DialError {
    /// No session is registered for the client key
    #[error("No session for client {0}")]
    UnknownClient(ClientKey),

    /// The chosen session failed while sending the dial request
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

impl From<DialError> for io::Error {
    fn from(err: DialError) -> Self {
        match err {
            DialError::UnknownClient(_) => io::Error::new(io::ErrorKind::NotFound, err),
            DialError::Session(e) => e.into(),
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Terminal state of one logical connection.
///
/// Set exactly once on the connection's read buffer. Reads surface it
/// after any buffered bytes are drained; writes fail with it immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly close by either side
    Eof,
    /// The session carrying the connection went away
    ClosedPipe,
    /// The peer reported this error
    Remote(String),
    /// A local failure
    Local(io::ErrorKind, String),
}

impl CloseReason {
    /// Interpret the text of a received error message
    pub fn from_remote(message: &str) -> Self {
        if message == EOF_MESSAGE {
            CloseReason::Eof
        } else {
            CloseReason::Remote(message.to_string())
        }
    }

    /// Classify a local I/O result
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => CloseReason::Eof,
            kind => CloseReason::Local(kind, err.to_string()),
        }
    }

    /// Text sent to the peer in an error message
    pub fn wire_message(&self) -> String {
        match self {
            CloseReason::Eof => EOF_MESSAGE.to_string(),
            CloseReason::ClosedPipe => CLOSED_PIPE_MESSAGE.to_string(),
            CloseReason::Remote(message) | CloseReason::Local(_, message) => message.clone(),
        }
    }

    /// Whether this is an orderly close
    pub fn is_eof(&self) -> bool {
        matches!(self, CloseReason::Eof)
    }

    /// Error returned by reads (after EOF handling) and writes
    pub fn to_io_error(&self) -> io::Error {
        match self {
            CloseReason::Eof => io::Error::new(io::ErrorKind::BrokenPipe, EOF_MESSAGE),
            CloseReason::ClosedPipe => io::Error::new(io::ErrorKind::BrokenPipe, CLOSED_PIPE_MESSAGE),
            CloseReason::Remote(message) => {
                io::Error::new(io::ErrorKind::ConnectionReset, message.clone())
            }
            CloseReason::Local(kind, message) => io::Error::new(*kind, message.clone()),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.wire_message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_eof_is_orderly() {
        assert_eq!(CloseReason::from_remote("EOF"), CloseReason::Eof);
        assert_eq!(
            CloseReason::from_remote("dial tcp 10.0.0.5:80: connection refused"),
            CloseReason::Remote("dial tcp 10.0.0.5:80: connection refused".to_string())
        );
    }

    #[test]
    fn test_wire_message_roundtrip() {
        for reason in [CloseReason::Eof, CloseReason::Remote("boom".into())] {
            assert_eq!(CloseReason::from_remote(&reason.wire_message()), reason);
        }
    }

    #[test]
    fn test_io_error_kinds() {
        assert_eq!(
            CloseReason::ClosedPipe.to_io_error().kind(),
            io::ErrorKind::BrokenPipe
        );
        let err = CloseReason::Remote("connect not allowed".into()).to_io_error();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert!(err.to_string().contains("connect not allowed"));
        assert_eq!(
            CloseReason::from_io(&io::Error::from(io::ErrorKind::UnexpectedEof)),
            CloseReason::Eof
        );
    }

    #[test]
    fn test_dial_error_to_io() {
        let err: io::Error = DialError::UnknownClient(ClientKey::from("nope")).into();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
