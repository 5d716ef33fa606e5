//! revdial-agent: Agent side of the reverse tunnel
//!
//! The agent opens one outbound WebSocket to the server and dials
//! whatever the server asks for, subject to its egress policy, piping
//! bytes between the real connection and the tunnel.

pub mod connect;
pub mod dial;
pub mod policy;

pub use connect::{client_connect, ClientConnector, ClientError, OnConnect};
pub use dial::{pipe, DialExecutor, LocalDialer, LocalStream, NetDialer};
pub use policy::EgressPolicy;
