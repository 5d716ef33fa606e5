//! revdial-server: Server side of the reverse tunnel
//!
//! Agents connect to the server over WebSocket. Each accepted socket
//! becomes a [`Session`](revdial_core::Session) registered under the
//! agent's client key, and a [`Dialer`] opens connections through it to
//! addresses only the agent can reach.

pub mod auth;
pub mod forward;
pub mod listener;
pub mod registry;
pub mod selector;
pub mod server;

pub use auth::{AuthError, Authorizer, TokenAuthorizer};
pub use forward::Forwarder;
pub use listener::TunnelListener;
pub use registry::SessionRegistry;
pub use selector::{selector_for, PeerSelector};
pub use server::{Dialer, Server};
