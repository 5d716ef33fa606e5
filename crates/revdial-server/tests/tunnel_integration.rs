//! End-to-end tunnel tests
//!
//! A real server listener on loopback, a real agent connecting to it over
//! TCP, and a scripted dialer standing in for the agent's network.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use revdial_agent::{ClientConnector, ClientError, LocalDialer, LocalStream};
use revdial_core::config::ServerConfig;
use revdial_core::traits::AllowAll;
use revdial_core::types::{CLIENT_KEY_HEADER, TOKEN_HEADER};
use revdial_core::{ClientKey, DialError, NoopMetrics};
use revdial_server::{Server, TokenAuthorizer, TunnelListener};

const TOKEN: &str = "s3cret";
const HTTP_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";

/// Serves a single HTTP endpoint at 10.0.0.5:80
struct HttpDialer;

#[async_trait]
impl LocalDialer for HttpDialer {
    async fn dial(&self, proto: &str, address: &str) -> io::Result<Box<dyn LocalStream>> {
        if proto != "tcp" || address != "10.0.0.5:80" {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            ));
        }
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve_http(theirs));
        Ok(Box::new(ours))
    }
}

async fn serve_http(mut stream: DuplexStream) {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }
    let _ = stream.write_all(HTTP_RESPONSE).await;
}

struct TestServer {
    server: Arc<Server>,
    url: String,
    cancel: CancellationToken,
}

impl TestServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/connect", listener.local_addr().unwrap());

        let server = Arc::new(Server::new(
            Arc::new(TokenAuthorizer::new(vec![TOKEN.to_string()])),
            ServerConfig::default(),
            Arc::new(NoopMetrics),
        ));
        let cancel = CancellationToken::new();

        let tunnel_listener = TunnelListener::new(Arc::clone(&server), cancel.clone());
        tokio::spawn(async move { tunnel_listener.serve(listener).await });

        Self {
            server,
            url,
            cancel,
        }
    }

    fn agent(&self, client_id: &str, token: &str) -> ClientConnector {
        ClientConnector::new(self.url.clone())
            .header(CLIENT_KEY_HEADER, client_id)
            .header(TOKEN_HEADER, token)
            .with_authorizer(Arc::new(AllowAll))
            .with_dialer(Arc::new(HttpDialer))
            .with_reconnect_delay(Duration::from_millis(10))
    }

    fn spawn_agent(&self, client_id: &str) -> JoinHandle<Result<(), ClientError>> {
        let connector = self.agent(client_id, TOKEN);
        let cancel = self.cancel.clone();
        tokio::spawn(async move { connector.connect(cancel).await })
    }

    async fn wait_for(&self, key: &ClientKey) {
        let start = Instant::now();
        while !self.server.has_session(key) {
            assert!(
                start.elapsed() < Duration::from_secs(5),
                "{} never connected",
                key
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[tokio::test]
async fn test_http_request_through_agent() {
    let server = TestServer::start().await;
    let agent1 = ClientKey::from("agent1");
    let _agent = server.spawn_agent("agent1");
    server.wait_for(&agent1).await;

    let mut conn = server
        .server
        .dial(&agent1, "tcp", "10.0.0.5:80")
        .await
        .unwrap();
    conn.write_all(b"GET / HTTP/1.1\r\nHost: 10.0.0.5\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    timeout(Duration::from_secs(5), conn.read_to_end(&mut response))
        .await
        .expect("response not received")
        .unwrap();
    assert_eq!(response, HTTP_RESPONSE);
}

#[tokio::test]
async fn test_list_clients_and_unknown_client() {
    let server = TestServer::start().await;
    let _a = server.spawn_agent("agent1");
    let _b = server.spawn_agent("agent2");
    server.wait_for(&ClientKey::from("agent1")).await;
    server.wait_for(&ClientKey::from("agent2")).await;

    assert_eq!(
        server.server.list_clients(),
        vec![ClientKey::from("agent1"), ClientKey::from("agent2")]
    );

    let err = server
        .server
        .dial(&ClientKey::from("nobody"), "tcp", "10.0.0.5:80")
        .await
        .unwrap_err();
    assert!(matches!(err, DialError::UnknownClient(key) if key.as_str() == "nobody"));
}

#[tokio::test]
async fn test_refused_dial_surfaces_on_stream() {
    let server = TestServer::start().await;
    let agent1 = ClientKey::from("agent1");
    let _agent = server.spawn_agent("agent1");
    server.wait_for(&agent1).await;

    let mut conn = server
        .server
        .dial(&agent1, "tcp", "10.0.0.9:22")
        .await
        .unwrap();
    let mut buf = [0u8; 8];
    let err = timeout(Duration::from_secs(5), conn.read(&mut buf))
        .await
        .expect("dial failure not reported")
        .unwrap_err();
    assert_eq!(err.to_string(), "dial tcp 10.0.0.9:22: connection refused");
}

#[tokio::test]
async fn test_bad_token_rejected() {
    let server = TestServer::start().await;

    let connector = server.agent("agent1", "wrong");
    let err = timeout(
        Duration::from_secs(5),
        connector.connect(CancellationToken::new()),
    )
    .await
    .expect("handshake did not finish")
    .unwrap_err();

    assert!(matches!(err, ClientError::Connect(_)));
    assert!(server.server.list_clients().is_empty());
}

#[tokio::test]
async fn test_agent_shutdown_unregisters_session() {
    let server = TestServer::start().await;
    let agent1 = ClientKey::from("agent1");

    let agent_cancel = CancellationToken::new();
    let connector = server.agent("agent1", TOKEN);
    let agent = {
        let cancel = agent_cancel.clone();
        tokio::spawn(async move { connector.connect(cancel).await })
    };
    server.wait_for(&agent1).await;

    agent_cancel.cancel();
    timeout(Duration::from_secs(5), agent)
        .await
        .expect("agent did not stop")
        .unwrap()
        .unwrap();

    let start = Instant::now();
    while server.server.has_session(&agent1) {
        assert!(start.elapsed() < Duration::from_secs(5), "session never removed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
