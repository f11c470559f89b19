use thiserror::Error;

/// Errors that can occur during RPC operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A message failed schema validation before it ever reached the broker.
    #[error("invalid message: {0}")]
    Validation(String),

    /// The broker is unreachable or the connection dropped.
    #[error("broker connection failed: {0}")]
    Connection(String),

    /// No correlated reply arrived within the caller's timeout.
    #[error("request timed out waiting for a reply")]
    Timeout,

    /// The server-side handler reported a failure in its reply.
    #[error("handler failed: {0}")]
    Handler(String),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A broker operation failed after the connection was established.
    #[error("broker error: {0}")]
    Broker(String),

    /// A delivery is missing metadata required to serve it, or its body is
    /// not a field map.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
}

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;
