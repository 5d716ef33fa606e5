//! revdial-core: Multiplexed sessions and shared configuration for revdial
//!
//! A [`Session`] owns one WebSocket and carries any number of logical
//! connections ([`TunnelStream`]) over it. Each connection has its own
//! bounded [`ReadBuffer`], which is the only flow control in the system.
//! The server and agent crates build on these types.

pub mod config;
pub mod error;
pub mod metrics;
pub mod session;
pub mod traits;
pub mod types;

pub use error::{CloseReason, DialError, SessionError, TunnelError};
pub use metrics::{CounterMetrics, MetricsSnapshot, NoopMetrics};
pub use session::{ReadBuffer, Session, SessionRole, SessionState, TunnelStream};
pub use traits::{ConnectAuthorizer, DialRequestHandler, MetricsSink};
pub use types::{ClientKey, TunnelAddr};
