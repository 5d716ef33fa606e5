//! Multiplexed sessions over one WebSocket
//!
//! A session owns both halves of the socket. One task runs the demux loop
//! that routes inbound frames to connections by id; every outbound frame,
//! from any task, goes through a single async lock around the sink.

mod read_buffer;
mod stream;

pub use read_buffer::ReadBuffer;
pub use stream::{TunnelStream, MAX_DATA_CHUNK};

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use revdial_protocol::{ConnId, Frame, FrameCodec, Message};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::error::{CloseReason, SessionError};
use crate::traits::{ConnectAuthorizer, DialRequestHandler, MetricsSink};
use crate::types::{ClientKey, TunnelAddr};
use stream::ConnState;

type WsSink = Pin<Box<dyn Sink<WsMessage, Error = WsError> + Send>>;
type WsSource = Pin<Box<dyn Stream<Item = Result<WsMessage, WsError>> + Send>>;

/// Which end of the tunnel a session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Accepted by the server; allocates odd conn ids
    Server,
    /// Opened by an agent; allocates even conn ids
    Client,
}

impl SessionRole {
    fn first_conn_id(self) -> u64 {
        match self {
            SessionRole::Server => 1,
            SessionRole::Client => 2,
        }
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet served
    Connecting,
    /// Demux loop running
    Active,
    /// Tearing down connections
    Draining,
    /// Fully closed
    Closed,
}

/// One physical WebSocket carrying many logical connections
pub struct Session {
    role: SessionRole,
    client_key: ClientKey,
    config: SessionConfig,
    sink: tokio::sync::Mutex<WsSink>,
    source: Mutex<Option<WsSource>>,
    conns: Mutex<HashMap<ConnId, Arc<ConnState>>>,
    next_conn_id: AtomicU64,
    state: Mutex<SessionState>,
    shutdown: CancellationToken,
    failure: Mutex<Option<SessionError>>,
    authorizer: Option<Arc<dyn ConnectAuthorizer>>,
    dial_handler: Option<Arc<dyn DialRequestHandler>>,
    metrics: Arc<dyn MetricsSink>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    /// Wrap an accepted WebSocket.
    ///
    /// Server sessions dial through the agent and refuse dial requests
    /// coming from it.
    pub fn new_server<S>(
        client_key: ClientKey,
        ws: WebSocketStream<S>,
        config: SessionConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(SessionRole::Server, client_key, ws, config, None, None, metrics)
    }

    /// Wrap a WebSocket opened by an agent.
    ///
    /// Dial requests from the server are checked with `authorizer` (none
    /// means every request is refused) and handed to `dial_handler`.
    pub fn new_client<S>(
        client_key: ClientKey,
        ws: WebSocketStream<S>,
        config: SessionConfig,
        authorizer: Option<Arc<dyn ConnectAuthorizer>>,
        dial_handler: Arc<dyn DialRequestHandler>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(
            SessionRole::Client,
            client_key,
            ws,
            config,
            authorizer,
            Some(dial_handler),
            metrics,
        )
    }

    fn new<S>(
        role: SessionRole,
        client_key: ClientKey,
        ws: WebSocketStream<S>,
        config: SessionConfig,
        authorizer: Option<Arc<dyn ConnectAuthorizer>>,
        dial_handler: Option<Arc<dyn DialRequestHandler>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = ws.split();
        Arc::new(Self {
            role,
            client_key,
            config,
            sink: tokio::sync::Mutex::new(Box::pin(sink)),
            source: Mutex::new(Some(Box::pin(source))),
            conns: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(role.first_conn_id()),
            state: Mutex::new(SessionState::Connecting),
            shutdown: CancellationToken::new(),
            failure: Mutex::new(None),
            authorizer,
            dial_handler,
            metrics,
        })
    }

    /// Which end of the tunnel this is
    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// Identity of the agent on the other end (or this agent)
    pub fn client_key(&self) -> &ClientKey {
        &self.client_key
    }

    /// Session tuning
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Whether the session has left the active state
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        lock(&self.conns).len()
    }

    fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }

    /// Run the demux loop until the socket fails, the keepalive window
    /// expires, `cancel` fires, or [`Session::close`] is called. Every
    /// connection is torn down before this returns.
    ///
    /// May be called once; later calls fail with
    /// [`SessionError::AlreadyServing`].
    pub async fn serve(self: &Arc<Self>, cancel: CancellationToken) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let mut source = lock(&self.source)
            .take()
            .ok_or(SessionError::AlreadyServing)?;

        self.set_state(SessionState::Active);
        self.metrics.add_session(self.client_key.as_str());
        tracing::info!("Session for {} active ({:?})", self.client_key, self.role);

        let keepalive = tokio::spawn(Arc::clone(self).keepalive());

        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            _ = self.shutdown.cancelled() => Ok(()),
            res = self.demux(&mut source) => res,
        };
        let result = match result {
            Ok(()) => lock(&self.failure).take().map_or(Ok(()), Err),
            Err(e) => Err(e),
        };

        let reason = match &result {
            Ok(()) | Err(SessionError::Disconnected) | Err(SessionError::Closed) => {
                CloseReason::ClosedPipe
            }
            Err(e) => {
                self.metrics.error(self.client_key.as_str());
                let kind = match e {
                    SessionError::KeepaliveTimeout(_) | SessionError::WriteTimeout => {
                        io::ErrorKind::TimedOut
                    }
                    _ => io::ErrorKind::BrokenPipe,
                };
                CloseReason::Local(kind, format!("session closed: {}", e))
            }
        };

        match &result {
            Ok(()) => tracing::info!("Session for {} closed", self.client_key),
            Err(e) => tracing::warn!("Session for {} ended: {}", self.client_key, e),
        }

        self.teardown(reason).await;
        keepalive.abort();
        drop(source);
        self.metrics.remove_session(self.client_key.as_str());

        result
    }

    async fn demux(self: &Arc<Self>, source: &mut WsSource) -> Result<(), SessionError> {
        loop {
            let msg = match tokio::time::timeout(self.config.ping_wait, source.next()).await {
                Err(_) => return Err(SessionError::KeepaliveTimeout(self.config.ping_wait)),
                Ok(None) => return Err(SessionError::Disconnected),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(msg))) => msg,
            };

            match msg {
                WsMessage::Binary(data) => {
                    self.metrics
                        .bytes_received(self.client_key.as_str(), data.len());
                    for frame in FrameCodec::decode_all(&data)? {
                        self.dispatch(frame).await;
                    }
                }
                WsMessage::Close(_) => return Err(SessionError::Disconnected),
                WsMessage::Ping(_) | WsMessage::Pong(_) => {
                    tracing::trace!("Keepalive from {}", self.client_key);
                }
                WsMessage::Text(_) | WsMessage::Frame(_) => {
                    tracing::debug!("Ignoring non-binary message from {}", self.client_key);
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, frame: Frame) {
        let Frame { conn_id, message } = frame;
        tracing::trace!("{} <- {:?} for {}", self.client_key, message.message_type(), conn_id);

        match message {
            Message::Data(data) => {
                let Some(conn) = self.lookup(conn_id) else {
                    tracing::debug!("Data for unknown {} on {}", conn_id, self.client_key);
                    return;
                };
                if let Err(reason) = conn.on_data(&data).await {
                    tracing::trace!("Dropping data for closed {}: {}", conn_id, reason);
                }
            }
            Message::Error { message } => {
                if let Some(conn) = self.remove_conn(conn_id) {
                    tracing::debug!("{} closed by peer: {}", conn_id, message);
                    conn.tunnel_close(CloseReason::from_remote(&message));
                }
            }
            Message::Connect { proto, address } => {
                self.accept_connect(conn_id, proto, address).await;
            }
        }
    }

    async fn accept_connect(self: &Arc<Self>, conn_id: ConnId, proto: String, address: String) {
        let allowed = self
            .authorizer
            .as_ref()
            .map_or(false, |auth| auth.authorize(&proto, &address));

        let handler = match &self.dial_handler {
            Some(handler) if allowed => Arc::clone(handler),
            _ => {
                tracing::warn!(
                    "Refusing dial of {}://{} from {}",
                    proto,
                    address,
                    self.client_key
                );
                self.reject(conn_id, "connect not allowed");
                return;
            }
        };

        let state = match self.register(conn_id, TunnelAddr::new(proto, address)) {
            Ok(state) => state,
            Err(e) => {
                tracing::debug!("Cannot accept {}: {}", conn_id, e);
                self.reject(conn_id, &e.to_string());
                return;
            }
        };

        tracing::debug!("{} dial request for {}", conn_id, state.addr);
        let stream = TunnelStream::new(Arc::clone(self), state);
        tokio::spawn(async move {
            handler.handle(stream).await;
        });
    }

    /// Refuse a dial request. Sent from its own task so the demux loop
    /// never waits on the writer.
    fn reject(self: &Arc<Self>, conn_id: ConnId, message: &str) {
        let session = Arc::clone(self);
        let frame = Frame::error(conn_id, message);
        tokio::spawn(async move {
            if let Err(e) = session.write_frame(None, frame).await {
                tracing::debug!("Failed to reject {}: {}", conn_id, e);
            }
        });
    }

    /// Ask the peer to dial `proto`/`address` and return the tunneled
    /// connection.
    ///
    /// Returns as soon as the request is sent. Without a `deadline`, sending
    /// is bounded by the session's write timeout. A failed dial on the far
    /// side surfaces as an error on the first read or write.
    pub async fn server_connect(
        self: &Arc<Self>,
        proto: &str,
        address: &str,
        deadline: Option<Instant>,
    ) -> Result<TunnelStream, SessionError> {
        let id = ConnId::new(self.next_conn_id.fetch_add(2, Ordering::Relaxed));
        let state = self.register(id, TunnelAddr::new(proto, address))?;
        let stream = TunnelStream::new(Arc::clone(self), state);

        if let Err(e) = self
            .write_frame(
                deadline.or_else(|| self.control_deadline()),
                Frame::connect(id, proto, address),
            )
            .await
        {
            if let Some(conn) = self.remove_conn(id) {
                conn.tunnel_close(CloseReason::ClosedPipe);
            }
            return Err(e);
        }

        tracing::debug!("{} dialing {}://{} via {}", id, proto, address, self.client_key);
        Ok(stream)
    }

    /// Tear down one connection and tell the peer. Safe to call
    /// repeatedly; only the first call has an effect.
    pub async fn close_connection(&self, id: ConnId, reason: CloseReason) {
        let Some(conn) = self.remove_conn(id) else {
            return;
        };
        conn.tunnel_close(reason.clone());
        tracing::debug!("{} closed locally: {}", id, reason);

        if let Err(e) = self
            .write_frame(None, Frame::error(id, reason.wire_message()))
            .await
        {
            tracing::debug!("Could not notify peer of {} close: {}", id, e);
        }
    }

    /// Synchronous variant of [`Session::close_connection`] for `Drop`;
    /// the peer notification is spawned when a runtime is available.
    pub(crate) fn detach_connection(self: &Arc<Self>, id: ConnId, reason: CloseReason) {
        let Some(conn) = self.remove_conn(id) else {
            return;
        };
        conn.tunnel_close(reason.clone());
        if self.is_closed() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let session = Arc::clone(self);
                handle.spawn(async move {
                    let frame = Frame::error(id, reason.wire_message());
                    if let Err(e) = session.write_frame(None, frame).await {
                        tracing::debug!("Could not notify peer of {} close: {}", id, e);
                    }
                });
            }
            Err(_) => tracing::debug!("{} dropped outside a runtime, peer not notified", id),
        }
    }

    /// Close the session. Idempotent.
    ///
    /// A served session tears down from its `serve` call; one that was
    /// never served drops its connections here.
    pub fn close(&self) {
        self.shutdown.cancel();

        if lock(&self.source).take().is_some() {
            self.set_state(SessionState::Draining);
            self.drain_connections(CloseReason::ClosedPipe);
            self.set_state(SessionState::Closed);
        }
    }

    pub(crate) async fn write_data(
        &self,
        state: &ConnState,
        data: Bytes,
    ) -> io::Result<usize> {
        if let Some(reason) = state.terminal_error() {
            return Err(reason.to_io_error());
        }
        let len = data.len();
        self.write_frame(state.write_deadline(), Frame::data(state.id, data))
            .await?;
        Ok(len)
    }

    /// Encode and send one frame through the serialized writer. `None`
    /// waits as long as the peer takes to make room.
    pub(crate) async fn write_frame(
        &self,
        deadline: Option<Instant>,
        frame: Frame,
    ) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let data = FrameCodec::encode_frame(frame)?;
        let len = data.len();
        self.write_raw(deadline, WsMessage::Binary(data.to_vec()))
            .await?;
        self.metrics
            .bytes_transmitted(self.client_key.as_str(), len);
        Ok(())
    }

    /// Send through the sink lock, bounded by `deadline` when given and
    /// abandoned when the session shuts down.
    ///
    /// A deadline that passes before the message reaches the socket fails
    /// only this write. Once handed over the message is committed: if the
    /// flush outlasts the deadline it stays queued and goes out with the
    /// next write. Transport errors are terminal for the session.
    async fn write_raw(
        &self,
        deadline: Option<Instant>,
        msg: WsMessage,
    ) -> Result<(), SessionError> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(SessionError::Closed),
            res = self.send_raw(deadline, msg) => res,
        }
    }

    async fn send_raw(
        &self,
        deadline: Option<Instant>,
        msg: WsMessage,
    ) -> Result<(), SessionError> {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(SessionError::WriteTimeout);
        }

        let mut sink = within(deadline, self.sink.lock())
            .await
            .ok_or(SessionError::WriteTimeout)?;

        let sent = match within(deadline, sink.feed(msg)).await {
            None => return Err(SessionError::WriteTimeout),
            Some(Err(e)) => Err(e),
            Some(Ok(())) => match within(deadline, sink.flush()).await {
                Some(flushed) => flushed,
                None => {
                    tracing::trace!("Flush to {} outlasted the deadline", self.client_key);
                    Ok(())
                }
            },
        };

        match sent {
            Ok(()) => Ok(()),
            Err(e) => {
                drop(sink);
                tracing::warn!("Write to {} failed: {}", self.client_key, e);
                self.fail(e.into());
                Err(SessionError::Closed)
            }
        }
    }

    /// Record why the session is going down, then close it. Ignored once
    /// the session is already closing.
    fn fail(&self, err: SessionError) {
        if self.is_closed() {
            return;
        }
        lock(&self.failure).get_or_insert(err);
        self.close();
    }

    /// Deadline for frames the session sends on its own behalf
    fn control_deadline(&self) -> Option<Instant> {
        Some(Instant::now() + self.config.write_timeout)
    }

    async fn keepalive(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.ping_write_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let ping = WsMessage::Ping(Vec::new());
                    if let Err(e) = self.write_raw(self.control_deadline(), ping).await {
                        tracing::debug!("Ping to {} failed: {}", self.client_key, e);
                    }
                }
            }
        }
    }

    async fn teardown(&self, reason: CloseReason) {
        self.set_state(SessionState::Draining);
        // Cancel before draining so no new connection can register
        self.shutdown.cancel();

        let drained = self.drain_connections(reason);
        if drained > 0 {
            tracing::debug!("Closed {} connections of {}", drained, self.client_key);
        }

        let close_sink = async {
            let mut sink = self.sink.lock().await;
            let _ = sink.close().await;
        };
        if tokio::time::timeout(self.config.write_timeout, close_sink)
            .await
            .is_err()
        {
            tracing::debug!("Timed out closing socket of {}", self.client_key);
        }

        self.set_state(SessionState::Closed);
    }

    fn drain_connections(&self, reason: CloseReason) -> usize {
        let drained: Vec<Arc<ConnState>> = lock(&self.conns).drain().map(|(_, c)| c).collect();
        for conn in &drained {
            conn.tunnel_close(reason.clone());
            self.metrics.remove_connection(
                self.client_key.as_str(),
                &conn.addr.proto,
                &conn.addr.address,
            );
        }
        drained.len()
    }

    fn register(&self, id: ConnId, addr: TunnelAddr) -> Result<Arc<ConnState>, SessionError> {
        let mut conns = lock(&self.conns);
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        match conns.entry(id) {
            Entry::Occupied(_) => Err(SessionError::DuplicateConnId(id)),
            Entry::Vacant(entry) => {
                let state = Arc::new(ConnState::new(id, addr, self.config.read_buffer_size));
                entry.insert(Arc::clone(&state));
                self.metrics.add_connection(
                    self.client_key.as_str(),
                    &state.addr.proto,
                    &state.addr.address,
                );
                Ok(state)
            }
        }
    }

    fn lookup(&self, id: ConnId) -> Option<Arc<ConnState>> {
        lock(&self.conns).get(&id).cloned()
    }

    fn remove_conn(&self, id: ConnId) -> Option<Arc<ConnState>> {
        let conn = lock(&self.conns).remove(&id)?;
        self.metrics
            .remove_connection(self.client_key.as_str(), &conn.addr.proto, &conn.addr.address);
        Some(conn)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("client_key", &self.client_key)
            .field("state", &self.state())
            .field("connections", &self.connection_count())
            .finish()
    }
}

async fn within<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}
