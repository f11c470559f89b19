//! Broker abstractions.
//!
//! This module defines the domain-level interface the client and server
//! layers use to exchange envelopes. It intentionally avoids any reference
//! to concrete protocols or client libraries; higher-level semantics such as
//! correlation and timeouts live elsewhere.
//!
//! The broker is responsible only for queue declaration, delivery of opaque
//! envelopes to consumers, and acknowledgement bookkeeping. Concrete
//! backends live in the submodules: [`memory`] (always available, reference
//! semantics) and [`amqp`] (lapin, behind the `amqp` feature).

pub(crate) mod memory;

#[cfg(feature = "amqp")]
pub(crate) mod amqp;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::correlation::CorrelationId;
use crate::error::Result;

/// The wire unit: a payload plus routing and correlation metadata.
///
/// The broker does not interpret the payload; request and response bodies
/// are both just bytes here.
#[derive(Clone, Debug)]
pub struct Envelope {
    /// Destination queue name.
    pub queue: String,

    /// Opaque payload bytes.
    pub payload: Bytes,

    /// Correlation identifier associating a request with its response.
    pub correlation_id: Option<CorrelationId>,

    /// Queue the responder must publish its answer to. Set on requests,
    /// absent on responses.
    pub reply_to: Option<String>,
}

impl Envelope {
    /// An outbound request: carries both the correlation id and the caller's
    /// private reply queue.
    pub fn request(
        queue: impl Into<String>,
        payload: Bytes,
        correlation_id: CorrelationId,
        reply_to: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            payload,
            correlation_id: Some(correlation_id),
            reply_to: Some(reply_to.into()),
        }
    }

    /// An outbound response: carries the originating correlation id only.
    pub fn response(
        queue: impl Into<String>,
        payload: Bytes,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            queue: queue.into(),
            payload,
            correlation_id: Some(correlation_id),
            reply_to: None,
        }
    }
}

/// Queue declaration options.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueueOptions {
    /// Queue survives broker restarts and accumulates while unconsumed.
    pub durable: bool,
    /// Queue is private to the declaring connection.
    pub exclusive: bool,
    /// Queue is deleted when its last consumer goes away.
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Options for a work queue: durable, shared, kept around.
    pub fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Options for a private reply queue: exclusive and auto-deleted.
    pub fn ephemeral() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Consumer options.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsumeOptions {
    /// When set, deliveries must be explicitly acknowledged through
    /// [`Delivery::ack`]; otherwise the broker considers them settled on
    /// delivery.
    pub manual_ack: bool,

    /// Maximum unacknowledged deliveries this consumer may hold (QoS).
    /// `0` means unlimited. Only meaningful with `manual_ack`.
    pub prefetch: u16,
}

/// Settlement handle attached to a manual-ack delivery.
///
/// Backends implement this to route the ack back to wherever the delivery
/// came from.
#[async_trait::async_trait]
pub trait AckHandle: Send {
    async fn ack(self: Box<Self>) -> Result<()>;
    async fn reject(self: Box<Self>, requeue: bool) -> Result<()>;
}

/// An envelope received from a subscription, plus its settlement state.
pub struct Delivery {
    /// The received envelope.
    pub envelope: Envelope,
    acker: Option<Box<dyn AckHandle>>,
}

impl Delivery {
    pub(crate) fn new(envelope: Envelope, acker: Option<Box<dyn AckHandle>>) -> Self {
        Self { envelope, acker }
    }

    /// Acknowledge this delivery. A no-op for auto-ack subscriptions, and
    /// for deliveries already settled.
    pub async fn ack(&mut self) -> Result<()> {
        match self.acker.take() {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    /// Reject this delivery, optionally asking the broker to requeue it.
    pub async fn reject(&mut self, requeue: bool) -> Result<()> {
        match self.acker.take() {
            Some(acker) => acker.reject(requeue).await,
            None => Ok(()),
        }
    }
}

/// Handle returned from a successful [`Broker::consume`].
///
/// The subscription stays active until the handle is dropped or the broker
/// is closed.
pub struct SubscriptionHandle {
    /// Receiver channel for deliveries on the consumed queue.
    pub inbox: mpsc::Receiver<Delivery>,
}

/// A long-lived connection to a message broker.
///
/// Implementations must ensure that once `consume()` returns, matching
/// envelopes published afterwards are deliverable to the returned inbox, and
/// that `publish()` does not block on subscribers. The in-memory broker is
/// the reference for these semantics.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Declare a queue, creating it if absent.
    ///
    /// An empty `name` asks the broker to generate one; the actual queue
    /// name is returned either way.
    async fn declare_queue(&self, name: &str, opts: QueueOptions) -> Result<String>;

    /// Publish an envelope to its destination queue.
    async fn publish(&self, env: Envelope) -> Result<()>;

    /// Start consuming a queue.
    async fn consume(&self, queue: &str, opts: ConsumeOptions) -> Result<SubscriptionHandle>;

    /// Close the connection and release its resources.
    async fn close(&self) -> Result<()>;
}

/// Shared broker pointer. Clones share the underlying connection.
pub type BrokerPtr = Arc<dyn Broker>;
