//! Error types for virtmon.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use thiserror::Error;

/// Result type alias for virtmon operations.
pub type Result<T> = std::result::Result<T, VirtmonError>;

/// Main error type for virtmon.
#[derive(Error, Debug)]
pub enum VirtmonError {
    // Inspection errors
    #[error("Failed to inspect domain {domain}: {reason}")]
    Inspect { domain: String, reason: String },

    #[error("Lost connection to hypervisor: {reason}")]
    ConnectionLost { reason: String },

    #[error("Metric {metric} unavailable for domain {domain}: {reason}")]
    MetricUnavailable { domain: String, metric: String, reason: String },

    // Host resolution errors
    #[error("Host not found on monitoring server: {host}")]
    HostNotFound { host: String },

    #[error("Host name {host} is ambiguous: {count} hosts match")]
    AmbiguousHost { host: String, count: usize },

    #[error("Host {host} could not be resolved in this cycle")]
    HostUnresolved { host: String },

    // Monitoring-server RPC errors
    #[error("API error {code} calling {method}: {message}, {data}")]
    Api { method: String, code: i64, message: String, data: String },

    #[error("API transport error calling {method}: {reason}")]
    ApiTransport { method: String, reason: String },

    // Sender errors
    #[error("Sender protocol error: {reason}")]
    Protocol { reason: String },

    #[error("I/O error talking to {endpoint}: {source}")]
    Io {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VirtmonError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    /// Whether the error means the hypervisor connection must be re-established.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost { .. })
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Inspect { .. } => "inspect",
            Self::ConnectionLost { .. } => "connection_lost",
            Self::MetricUnavailable { .. } => "metric_unavailable",
            Self::HostNotFound { .. }
            | Self::AmbiguousHost { .. }
            | Self::HostUnresolved { .. } => {
                "host"
            }
            Self::Api { .. } => "api",
            Self::ApiTransport { .. } => "api_transport",
            Self::Protocol { .. } => "protocol",
            Self::Io { .. } => "io",
            Self::InvalidConfig { .. } => "config",
            Self::Internal(_) | Self::Other(_) => "internal",
        }
    }
}
