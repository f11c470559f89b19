//! Public, broker-agnostic RPC configuration.
//!
//! This type intentionally contains no broker-specific concepts; the broker
//! backends interpret it into concrete connection settings.

/// Connection parameters for [`create_broker`](crate::create_broker).
#[derive(Debug, Clone, Default)]
pub struct RpcConfig {
    /// Broker connection URI (e.g. `"amqp://localhost:5672/%2f"`).
    ///
    /// `None` selects the in-memory broker, which needs no external
    /// resources.
    pub broker_uri: Option<String>,

    /// Identifier for this connection, used in logging and consumer tags.
    pub connection_id: String,
}

impl RpcConfig {
    /// Configuration pointing at a real broker.
    pub fn with_broker(broker_uri: impl Into<String>, connection_id: impl Into<String>) -> Self {
        Self {
            broker_uri: Some(broker_uri.into()),
            connection_id: connection_id.into(),
        }
    }

    /// Configuration for the in-memory broker (no external broker).
    pub fn memory(connection_id: impl Into<String>) -> Self {
        Self {
            broker_uri: None,
            connection_id: connection_id.into(),
        }
    }
}
