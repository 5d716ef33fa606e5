//! Logical connections carried by a session

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::BoxFuture;
use revdial_protocol::ConnId;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

use super::read_buffer::ReadBuffer;
use super::Session;
use crate::error::CloseReason;
use crate::types::TunnelAddr;

/// Largest payload placed in a single data frame
pub const MAX_DATA_CHUNK: usize = 32 * 1024;

/// State of one connection shared between the session registry and the
/// user-facing [`TunnelStream`].
///
/// The registry holds only this, never the stream, so a session and its
/// connections do not own each other.
#[derive(Debug)]
pub(crate) struct ConnState {
    pub(crate) id: ConnId,
    pub(crate) addr: TunnelAddr,
    pub(crate) buffer: ReadBuffer,
    write_deadline: Mutex<Option<Instant>>,
}

impl ConnState {
    pub(crate) fn new(id: ConnId, addr: TunnelAddr, buffer_size: usize) -> Self {
        Self {
            id,
            addr,
            buffer: ReadBuffer::new(buffer_size),
            write_deadline: Mutex::new(None),
        }
    }

    pub(crate) fn write_deadline(&self) -> Option<Instant> {
        *self
            .write_deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self
            .write_deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = deadline;
    }

    /// Offer inbound payload. Runs inline in the demux loop, so a full
    /// buffer stalls the whole session.
    pub(crate) async fn on_data(&self, data: &[u8]) -> Result<(), CloseReason> {
        self.buffer.offer(data).await
    }

    /// Set the terminal error; false if one was already set
    pub(crate) fn tunnel_close(&self, reason: CloseReason) -> bool {
        self.buffer.close(reason)
    }

    pub(crate) fn terminal_error(&self) -> Option<CloseReason> {
        self.buffer.terminal_error()
    }
}

/// One logical connection multiplexed over a [`Session`].
///
/// Reads come from the connection's bounded buffer, writes are framed and
/// sent through the session's serialized writer. Dropping a stream that
/// was never closed closes it with EOF.
pub struct TunnelStream {
    session: Arc<Session>,
    state: Arc<ConnState>,
    read_timer: Option<Pin<Box<Sleep>>>,
    pending_write: Option<BoxFuture<'static, io::Result<usize>>>,
    closing: Option<BoxFuture<'static, ()>>,
    shut_down: bool,
}

impl TunnelStream {
    pub(crate) fn new(session: Arc<Session>, state: Arc<ConnState>) -> Self {
        Self {
            session,
            state,
            read_timer: None,
            pending_write: None,
            closing: None,
            shut_down: false,
        }
    }

    /// Connection id within the session
    pub fn conn_id(&self) -> ConnId {
        self.state.id
    }

    /// The dialed address
    pub fn local_addr(&self) -> &TunnelAddr {
        &self.state.addr
    }

    /// The dialed address
    pub fn remote_addr(&self) -> &TunnelAddr {
        &self.state.addr
    }

    /// Session carrying this connection
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Reads fail with `TimedOut` once `deadline` passes; `None` clears it
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.state.buffer.set_read_deadline(deadline);
    }

    /// Writes fail with `TimedOut` once `deadline` passes; `None` lets a
    /// write wait until the peer drains its buffer
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.state.set_write_deadline(deadline);
    }

    /// Set both deadlines
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Close with EOF and tell the peer
    pub fn close(&self) -> impl Future<Output = ()> + Send + 'static {
        self.close_with(CloseReason::Eof)
    }

    /// Close with `reason` and tell the peer. Repeated calls are no-ops.
    ///
    /// The returned future does not borrow the stream.
    pub fn close_with(&self, reason: CloseReason) -> impl Future<Output = ()> + Send + 'static {
        let session = Arc::clone(&self.session);
        let id = self.state.id;
        async move { session.close_connection(id, reason).await }
    }
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream")
            .field("conn_id", &self.state.id)
            .field("addr", &self.state.addr)
            .field("client_key", self.session.client_key())
            .finish()
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        this.state.buffer.poll_read(cx, buf, &mut this.read_timer)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;

        let mut fut = match this.pending_write.take() {
            Some(fut) => fut,
            None => {
                if let Some(reason) = this.state.terminal_error() {
                    return Poll::Ready(Err(reason.to_io_error()));
                }
                if buf.is_empty() {
                    return Poll::Ready(Ok(0));
                }
                let chunk = Bytes::copy_from_slice(&buf[..buf.len().min(MAX_DATA_CHUNK)]);
                let session = Arc::clone(&this.session);
                let state = Arc::clone(&this.state);
                Box::pin(async move { session.write_data(&state, chunk).await })
            }
        };

        match fut.as_mut().poll(cx) {
            Poll::Ready(result) => Poll::Ready(result),
            Poll::Pending => {
                this.pending_write = Some(fut);
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Every completed write is already on the socket
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.shut_down {
            return Poll::Ready(Ok(()));
        }

        let session = &this.session;
        let id = this.state.id;
        let fut = this.closing.get_or_insert_with(|| {
            let session = Arc::clone(session);
            Box::pin(async move { session.close_connection(id, CloseReason::Eof).await })
        });

        match fut.as_mut().poll(cx) {
            Poll::Ready(()) => {
                this.closing = None;
                this.shut_down = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        self.session.detach_connection(self.state.id, CloseReason::Eof);
    }
}
