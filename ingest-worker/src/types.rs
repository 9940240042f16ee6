//! Shared types for the ingest worker

use serde::{Deserialize, Serialize};
use std::fmt;

/// Report source excerpt used when the payload exceeds the excerpt limit
pub const SOURCE_TOO_LARGE: &str = "Bundle too large";

/// Report source used when the payload could not be decoded
pub const SOURCE_UNPARSEABLE: &str = "Unparseable";

/// Broker connection parameters for one queue
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Broker host
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Virtual host
    pub vhost: String,
    /// Username
    pub user: String,
    /// Password
    pub pass: String,
    /// Connect over TLS
    #[serde(default)]
    pub use_ssl: bool,
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("vhost", &self.vhost)
            .field("user", &self.user)
            .field("pass", &"***")
            .field("use_ssl", &self.use_ssl)
            .finish()
    }
}

/// One queue to consume, as advertised by the connector registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorDescriptor {
    /// Queue name (unique key of a consumer)
    pub queue_name: String,
    /// Connection parameters
    pub connection: ConnectionParams,
}

impl ConnectorDescriptor {
    /// Create new descriptor
    pub fn new(queue_name: impl Into<String>, connection: ConnectionParams) -> Self {
        Self {
            queue_name: queue_name.into(),
            connection,
        }
    }
}

/// Failure report attached to a work id when a message is given up on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    /// Error text
    pub error: String,
    /// Source excerpt (or a marker when too large / unparseable)
    pub source: String,
}

impl FailureReport {
    /// Build a report, eliding the source when it has `limit` characters or more
    pub fn new(error: impl Into<String>, source: &str, limit: usize) -> Self {
        let source = if source.chars().count() < limit {
            source.to_string()
        } else {
            SOURCE_TOO_LARGE.to_string()
        };

        Self {
            error: error.into(),
            source,
        }
    }
}
