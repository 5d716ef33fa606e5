//! Outbound WebSocket connector
//!
//! Opens the agent's single WebSocket to the server and serves it as a
//! client session. One call is one attempt: retrying is left to the
//! caller, which gets a fixed pause after every failure.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue};
use tokio_tungstenite::Connector;
use tokio_util::sync::CancellationToken;

use revdial_core::config::{ClientConfig, SessionConfig};
use revdial_core::types::CLIENT_KEY_HEADER;
use revdial_core::{
    ClientKey, ConnectAuthorizer, MetricsSink, NoopMetrics, Session, SessionError,
};

use crate::dial::{DialExecutor, LocalDialer, NetDialer};
use crate::policy::EgressPolicy;

/// Callback run once per established session, concurrently with it.
///
/// Returning an error tears the session down.
pub type OnConnect =
    Arc<dyn Fn(CancellationToken, Arc<Session>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Connection attempt failures
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server URL cannot be turned into a request
    #[error("Invalid server URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    /// A handshake header name or value is malformed
    #[error("Invalid handshake header {0}")]
    InvalidHeader(String),

    /// TCP connect, TLS or the upgrade failed (including auth refusal)
    #[error("Failed to connect: {0}")]
    Connect(#[source] tokio_tungstenite::tungstenite::Error),

    /// The session ended with an error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// The session task panicked or was aborted
    #[error("Session task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// The on-connect callback failed
    #[error("On-connect callback failed: {0}")]
    OnConnect(#[source] anyhow::Error),
}

/// Builder for the agent's connection to the server
pub struct ClientConnector {
    url: String,
    headers: Vec<(String, String)>,
    tls: Option<Connector>,
    authorizer: Option<Arc<dyn ConnectAuthorizer>>,
    dialer: Arc<dyn LocalDialer>,
    on_connect: Option<OnConnect>,
    session_config: SessionConfig,
    dial_timeout: Duration,
    reconnect_delay: Duration,
    metrics: Arc<dyn MetricsSink>,
}

impl ClientConnector {
    /// Connector for `url` with default timings and no dial authorizer
    /// (every dial request is refused until one is set)
    pub fn new(url: impl Into<String>) -> Self {
        let defaults = ClientConfig::default();
        Self {
            url: url.into(),
            headers: Vec::new(),
            tls: None,
            authorizer: None,
            dialer: Arc::new(NetDialer),
            on_connect: None,
            session_config: defaults.session,
            dial_timeout: defaults.dial_timeout,
            reconnect_delay: defaults.reconnect_delay,
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Connector configured from an agent config file, with its egress
    /// policy as the dial authorizer
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.server_url.clone())
            .with_headers(config.handshake_headers())
            .with_authorizer(Arc::new(EgressPolicy::new(&config.egress)))
            .with_session_config(config.session.clone())
            .with_dial_timeout(config.dial_timeout)
            .with_reconnect_delay(config.reconnect_delay)
    }

    /// Replace all handshake headers
    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    /// Add one handshake header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// TLS connector for `wss://` URLs
    pub fn with_tls(mut self, connector: Connector) -> Self {
        self.tls = Some(connector);
        self
    }

    /// Check dial requests with `authorizer`
    pub fn with_authorizer(mut self, authorizer: Arc<dyn ConnectAuthorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Dial with `dialer` instead of the operating system
    pub fn with_dialer(mut self, dialer: Arc<dyn LocalDialer>) -> Self {
        self.dialer = dialer;
        self
    }

    /// Run `callback` once each session is established
    pub fn on_connect(mut self, callback: OnConnect) -> Self {
        self.on_connect = Some(callback);
        self
    }

    /// Session tuning
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Bound on each local dial
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Pause after a failed attempt
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Metrics sink for the session
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Server URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Identity sent in the client key header, or `agent` if unset
    pub fn client_key(&self) -> ClientKey {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(CLIENT_KEY_HEADER))
            .map(|(_, value)| ClientKey::from(value.as_str()))
            .unwrap_or_else(|| ClientKey::from("agent"))
    }

    /// Make one connection attempt and serve it until it ends.
    ///
    /// Returns `Ok` when `cancel` fires. On any failure the error is
    /// returned after sleeping the reconnect delay; there is no retry here.
    pub async fn connect(&self, cancel: CancellationToken) -> Result<(), ClientError> {
        let result = self.connect_once(&cancel).await;

        if let Err(e) = &result {
            if !cancel.is_cancelled() {
                tracing::warn!(
                    "Tunnel to {} failed: {} - pausing {:?}",
                    self.url,
                    e,
                    self.reconnect_delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.reconnect_delay) => {}
                }
            }
        }

        result
    }

    fn build_request(&self) -> Result<Request, ClientError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|source| ClientError::InvalidUrl {
                url: self.url.clone(),
                source,
            })?;

        for (name, value) in &self.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ClientError::InvalidHeader(name.clone()))?;
            let header_value =
                HeaderValue::from_str(value).map_err(|_| ClientError::InvalidHeader(name.clone()))?;
            request.headers_mut().append(header_name, header_value);
        }

        Ok(request)
    }

    async fn connect_once(&self, cancel: &CancellationToken) -> Result<(), ClientError> {
        let request = self.build_request()?;
        tracing::info!("Connecting to {}", self.url);

        let connecting = tokio_tungstenite::connect_async_tls_with_config(
            request,
            None,
            true,
            self.tls.clone(),
        );
        let (ws, _response) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            result = connecting => result.map_err(ClientError::Connect)?,
        };

        let handler = Arc::new(DialExecutor::with_dialer(
            Arc::clone(&self.dialer),
            self.dial_timeout,
        ));
        let session = Session::new_client(
            self.client_key(),
            ws,
            self.session_config.clone(),
            self.authorizer.clone(),
            handler,
            Arc::clone(&self.metrics),
        );
        tracing::info!("Connected to {} as {}", self.url, session.client_key());

        let session_cancel = cancel.child_token();
        let mut serve = tokio::spawn({
            let session = Arc::clone(&session);
            let session_cancel = session_cancel.clone();
            async move { session.serve(session_cancel).await }
        });

        let on_connect = async {
            match &self.on_connect {
                Some(callback) => {
                    match callback(session_cancel.clone(), Arc::clone(&session)).await {
                        Ok(()) => std::future::pending().await,
                        Err(e) => e,
                    }
                }
                None => std::future::pending().await,
            }
        };

        let result = tokio::select! {
            joined = &mut serve => joined?.map_err(ClientError::from),
            e = on_connect => {
                session.close();
                let _ = serve.await;
                Err(ClientError::OnConnect(e))
            }
        };

        session_cancel.cancel();
        result
    }
}

/// One connection attempt with explicit parameters.
///
/// `headers` go on the upgrade request, `connector` provides TLS for
/// `wss://` URLs, and `authorizer` decides which dial requests are honoured
/// (none refuses all of them).
pub async fn client_connect(
    cancel: CancellationToken,
    url: &str,
    headers: Vec<(String, String)>,
    connector: Option<Connector>,
    authorizer: Option<Arc<dyn ConnectAuthorizer>>,
    on_connect: Option<OnConnect>,
) -> Result<(), ClientError> {
    let mut client = ClientConnector::new(url).with_headers(headers);
    client.tls = connector;
    client.authorizer = authorizer;
    client.on_connect = on_connect;
    client.connect(cancel).await
}
