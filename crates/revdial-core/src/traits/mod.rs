//! Trait seams between the session layer and its collaborators

mod dial;
mod metrics;

pub use dial::{AllowAll, ConnectAuthorizer, DialRequestHandler};
pub use metrics::MetricsSink;
