//! Handshake authorization
//!
//! Runs during the WebSocket upgrade and decides which client key, if
//! any, the new session is registered under.

use std::collections::HashSet;

use revdial_core::types::{CLIENT_KEY_HEADER, TOKEN_HEADER};
use revdial_core::ClientKey;
use thiserror::Error;
use tokio_tungstenite::tungstenite::handshake::server::Request;

/// Why a handshake was refused
#[derive(Debug, Error)]
pub enum AuthError {
    /// The client key header is missing or empty
    #[error("Missing {} header", CLIENT_KEY_HEADER)]
    MissingClientKey,

    /// The token header is missing or not one of the accepted tokens
    #[error("Invalid tunnel token")]
    InvalidToken,

    /// Refused by a custom policy
    #[error("{0}")]
    Rejected(String),
}

/// Decides whether an upgrade request may become a session.
///
/// `Ok(Some(key))` accepts under `key`, `Ok(None)` refuses quietly, and
/// `Err` refuses with a reason sent back to the agent.
pub trait Authorizer: Send + Sync {
    /// Inspect the upgrade request
    fn authorize(&self, req: &Request) -> Result<Option<ClientKey>, AuthError>;
}

impl<F> Authorizer for F
where
    F: Fn(&Request) -> Result<Option<ClientKey>, AuthError> + Send + Sync,
{
    fn authorize(&self, req: &Request) -> Result<Option<ClientKey>, AuthError> {
        self(req)
    }
}

fn header<'a>(req: &'a Request, name: &str) -> Option<&'a str> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Takes the client key from the request headers and checks a shared
/// token. With no tokens configured every agent is accepted.
#[derive(Debug, Clone, Default)]
pub struct TokenAuthorizer {
    tokens: HashSet<String>,
}

impl TokenAuthorizer {
    /// Accept agents presenting any of `tokens`
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens: tokens.into_iter().filter(|t| !t.is_empty()).collect(),
        }
    }

    /// Whether any agent is accepted without a token
    pub fn is_open(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authorizer for TokenAuthorizer {
    fn authorize(&self, req: &Request) -> Result<Option<ClientKey>, AuthError> {
        let key = header(req, CLIENT_KEY_HEADER).ok_or(AuthError::MissingClientKey)?;

        if !self.tokens.is_empty() {
            let token = header(req, TOKEN_HEADER).ok_or(AuthError::InvalidToken)?;
            if !self.tokens.contains(token) {
                return Err(AuthError::InvalidToken);
            }
        }

        Ok(Some(ClientKey::from(key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: &[(&str, &str)]) -> Request {
        let mut builder = Request::builder().uri("ws://localhost:8123/connect");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_open_authorizer_accepts_any_token() {
        let auth = TokenAuthorizer::new(Vec::new());
        assert!(auth.is_open());

        let key = auth
            .authorize(&request(&[(CLIENT_KEY_HEADER, "agent1")]))
            .unwrap();
        assert_eq!(key, Some(ClientKey::from("agent1")));
    }

    #[test]
    fn test_missing_client_key_rejected() {
        let auth = TokenAuthorizer::new(Vec::new());
        assert!(matches!(
            auth.authorize(&request(&[])),
            Err(AuthError::MissingClientKey)
        ));
        assert!(matches!(
            auth.authorize(&request(&[(CLIENT_KEY_HEADER, "  ")])),
            Err(AuthError::MissingClientKey)
        ));
    }

    #[test]
    fn test_token_checked_when_configured() {
        let auth = TokenAuthorizer::new(vec!["s3cret".to_string()]);

        let ok = auth.authorize(&request(&[
            (CLIENT_KEY_HEADER, "agent1"),
            (TOKEN_HEADER, "s3cret"),
        ]));
        assert_eq!(ok.unwrap(), Some(ClientKey::from("agent1")));

        let wrong = auth.authorize(&request(&[
            (CLIENT_KEY_HEADER, "agent1"),
            (TOKEN_HEADER, "guess"),
        ]));
        assert!(matches!(wrong, Err(AuthError::InvalidToken)));

        let missing = auth.authorize(&request(&[(CLIENT_KEY_HEADER, "agent1")]));
        assert!(matches!(missing, Err(AuthError::InvalidToken)));
    }

    #[test]
    fn test_closure_authorizer() {
        let only_agent1 = |req: &Request| -> Result<Option<ClientKey>, AuthError> {
            Ok(header(req, CLIENT_KEY_HEADER)
                .filter(|k| *k == "agent1")
                .map(ClientKey::from))
        };
        assert!(only_agent1
            .authorize(&request(&[(CLIENT_KEY_HEADER, "agent2")]))
            .unwrap()
            .is_none());
    }
}
