//! Error types shared across the gateway.

use thiserror::Error;

/// Failures talking to the shared broker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    /// I/O failure after the command may have reached the server.
    #[error("broker command {command} failed: {reason}")]
    Command {
        command: &'static str,
        reason: String,
    },

    /// The server answered with an error reply.
    #[error("broker rejected {command}: {reason}")]
    Rejected {
        command: &'static str,
        reason: String,
    },

    #[error("subscribe to {channel} failed: {reason}")]
    Subscribe { channel: String, reason: String },

    #[error("broker connection is closed")]
    Closed,

    #[error("unsupported broker url: {0}")]
    UnsupportedUrl(String),
}

impl BrokerError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_) | BrokerError::Command { .. }
        )
    }

    /// Whether the command certainly never reached the server, so even a
    /// non-idempotent command can be sent again.
    pub fn is_unsent(&self) -> bool {
        matches!(self, BrokerError::Connection(_))
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Failures of a presence counter change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CounterError {
    /// The counter was not changed.
    #[error(transparent)]
    NotApplied(BrokerError),

    /// The counter changed to `count` but the new value was not published.
    #[error("count changed to {count} but was not announced: {source}")]
    NotAnnounced { count: i64, source: BrokerError },
}

impl CounterError {
    pub fn broker_error(&self) -> &BrokerError {
        match self {
            CounterError::NotApplied(e) => e,
            CounterError::NotAnnounced { source, .. } => source,
        }
    }
}

impl From<CounterError> for BrokerError {
    fn from(err: CounterError) -> Self {
        match err {
            CounterError::NotApplied(e) => e,
            CounterError::NotAnnounced { source, .. } => source,
        }
    }
}

/// Failures surfaced to the transport layer for a single session.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway is degraded and not accepting new sessions")]
    Degraded,

    #[error("gateway is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl From<CounterError> for GatewayError {
    fn from(err: CounterError) -> Self {
        GatewayError::Broker(err.into())
    }
}

/// Startup configuration problems. All of them are fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing broker url (set broker.url, GATEWAY_BROKER__URL or --broker-url)")]
    MissingBrokerUrl,

    #[error("invalid listen address {addr}: {reason}")]
    InvalidListenAddress { addr: String, reason: String },

    #[error("invalid CORS origin: {0:?}")]
    InvalidCorsOrigin(String),
}
