//! Synchronous-style RPC over queue-based message brokers.
//!
//! This library gives callers the illusion of a blocking function call
//! across process boundaries on top of a one-way message broker. It handles
//! correlation id generation, ephemeral reply queues, request/response
//! matching, timeout-bound waits, and consumer concurrency control
//! (QoS/prefetch).
//!
//! An in-memory broker with reference semantics is always available; an
//! AMQP backend (lapin) sits behind the `amqp` feature. The `storage`
//! feature adds a uniform facade over cloud object-storage providers.
//!
//! # Example
//!
//! ```
//! use queue_rpc::{
//!     create_broker, FieldType, Message, RpcClient, RpcConfig, RpcServer,
//!     Schema, ServerOptions,
//! };
//! use serde_json::{json, Value};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> queue_rpc::Result<()> {
//! let broker = create_broker(&RpcConfig::memory("example")).await?;
//!
//! let server = RpcServer::start(
//!     broker.clone(),
//!     "add",
//!     ServerOptions::default(),
//!     |fields| async move {
//!         let x = fields["x"].as_i64().unwrap_or(0);
//!         let y = fields["y"].as_i64().unwrap_or(0);
//!         Ok(Value::from(x + y))
//!     },
//! )
//! .await?;
//!
//! let schema = Schema::new("add")
//!     .field("x", FieldType::Int)
//!     .field("y", FieldType::Int);
//! let message = Message::new(
//!     &schema,
//!     [("x".to_string(), json!(3)), ("y".to_string(), json!(5))]
//!         .into_iter()
//!         .collect(),
//! )?;
//!
//! let client = RpcClient::connect(broker).await?;
//! let sum: i64 = client
//!     .call_as(&message, "add", Some(Duration::from_secs(5)))
//!     .await?;
//! assert_eq!(sum, 8);
//!
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

mod broker;
mod client;
mod config;
mod correlation;
mod error;
mod schema;

pub mod server;

#[cfg(feature = "storage")]
pub mod storage;

// --- public re-exports
pub use broker::{
    //
    AckHandle,
    Broker,
    BrokerPtr,
    ConsumeOptions,
    Delivery,
    Envelope,
    QueueOptions,
    SubscriptionHandle,
};

pub use broker::memory::create_memory_broker;

#[cfg(feature = "amqp")]
pub use broker::amqp::create_amqp_broker;

pub use client::RpcClient;
pub use config::RpcConfig;
pub use correlation::CorrelationId;
pub use error::{Error, Result};
pub use schema::{
    //
    decode_fields,
    encode_fields,
    FieldType,
    Fields,
    Message,
    Reply,
    ReplyError,
    Schema,
    SchemaRegistry,
};
pub use server::{RpcServer, ServerOptions};

/// Create a broker connection from configuration.
///
/// A `broker_uri` selects the AMQP backend; no URI selects the in-memory
/// broker.
pub async fn create_broker(config: &RpcConfig) -> Result<BrokerPtr> {
    match &config.broker_uri {
        Some(uri) => {
            #[cfg(feature = "amqp")]
            {
                broker::amqp::create_amqp_broker(uri, &config.connection_id).await
            }
            #[cfg(not(feature = "amqp"))]
            {
                let _ = uri;
                Err(Error::Connection(
                    "broker_uri set but built without the 'amqp' feature".into(),
                ))
            }
        }
        None => broker::memory::create_memory_broker().await,
    }
}
