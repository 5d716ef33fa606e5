//! Server state and the dial API

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use revdial_core::config::ServerConfig;
use revdial_core::{ClientKey, DialError, MetricsSink, Session, SessionError, TunnelStream};

use crate::auth::Authorizer;
use crate::registry::SessionRegistry;
use crate::selector::{selector_for, PeerSelector};

/// Accepts agent sessions and dials through them
pub struct Server {
    registry: Arc<SessionRegistry>,
    selector: Arc<dyn PeerSelector>,
    authorizer: Arc<dyn Authorizer>,
    config: ServerConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl Server {
    /// Create a server with the selector named in `config`
    pub fn new(
        authorizer: Arc<dyn Authorizer>,
        config: ServerConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            selector: selector_for(config.selection),
            authorizer,
            config,
            metrics,
        }
    }

    /// Replace the session selector
    pub fn with_selector(mut self, selector: Arc<dyn PeerSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Handshake authorizer
    pub fn authorizer(&self) -> &Arc<dyn Authorizer> {
        &self.authorizer
    }

    /// Live sessions
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Register a session under its client key
    pub fn add_session(&self, session: Arc<Session>) {
        self.registry.add(session.client_key().clone(), session);
    }

    /// Unregister a session
    pub fn remove_session(&self, session: &Arc<Session>) {
        self.registry.remove(session.client_key(), session);
    }

    /// Whether `key` has at least one live session
    pub fn has_session(&self, key: &ClientKey) -> bool {
        self.registry.has_session(key)
    }

    /// Connected client keys, sorted
    pub fn list_clients(&self) -> Vec<ClientKey> {
        self.registry.list_clients()
    }

    /// A connected client key chosen uniformly at random
    pub fn random_client(&self) -> Option<ClientKey> {
        self.registry
            .list_clients()
            .choose(&mut rand::thread_rng())
            .cloned()
    }

    /// Wrap an accepted WebSocket in a session for `key`, serve it and
    /// unregister it once it ends.
    pub async fn serve_websocket<S>(
        &self,
        key: ClientKey,
        ws: WebSocketStream<S>,
        cancel: CancellationToken,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session = Session::new_server(
            key,
            ws,
            self.config.session.clone(),
            Arc::clone(&self.metrics),
        );

        self.add_session(Arc::clone(&session));
        let result = session.serve(cancel).await;
        self.remove_session(&session);

        result
    }

    /// Dialer for connections through `key`'s agent
    pub fn dialer(&self, key: ClientKey) -> Dialer {
        Dialer {
            key,
            registry: Arc::clone(&self.registry),
            selector: Arc::clone(&self.selector),
            timeout: None,
        }
    }

    /// Shorthand for `self.dialer(key).dial(network, address)`
    pub async fn dial(
        &self,
        key: &ClientKey,
        network: &str,
        address: &str,
    ) -> Result<TunnelStream, DialError> {
        self.dialer(key.clone()).dial(network, address).await
    }
}

/// Opens connections through one client's sessions
#[derive(Clone)]
pub struct Dialer {
    key: ClientKey,
    registry: Arc<SessionRegistry>,
    selector: Arc<dyn PeerSelector>,
    timeout: Option<Duration>,
}

impl Dialer {
    /// Bound the time spent sending the dial request
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Client key this dialer goes through
    pub fn client_key(&self) -> &ClientKey {
        &self.key
    }

    /// Ask the agent to dial `address` over `network`.
    ///
    /// Fails at once with [`DialError::UnknownClient`] when the agent has
    /// no session. A dial the agent cannot complete surfaces as an error
    /// on the returned stream.
    pub async fn dial(&self, network: &str, address: &str) -> Result<TunnelStream, DialError> {
        let sessions = self.registry.sessions_for(&self.key);
        let session = self
            .selector
            .select(&sessions)
            .ok_or_else(|| DialError::UnknownClient(self.key.clone()))?;

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let stream = session.server_connect(network, address, deadline).await?;
        Ok(stream)
    }
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("key", &self.key)
            .field("timeout", &self.timeout)
            .finish()
    }
}
