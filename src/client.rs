//! RPC client implementation.
//!
//! The client declares a broker-named, exclusive, auto-deleted reply queue
//! and runs a background receive loop that matches incoming replies to
//! pending calls by correlation id.
//!
//! Each call mints a unique correlation id and registers a oneshot channel
//! in the pending map. When the correlated reply arrives, the receive loop
//! looks the channel up and wakes the waiting call. Keying by correlation
//! id (rather than one shared response slot) makes concurrent calls from a
//! single client safe: a late or interleaved reply can only ever fulfill
//! its own slot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

use crate::broker::{Broker, BrokerPtr, ConsumeOptions, Envelope, QueueOptions};
use crate::correlation::CorrelationId;
use crate::error::{Error, Result};
use crate::schema::{Message, Reply};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// The protected state is the pending-call map (correlation id → oneshot
/// sender); there are no invariants spanning fields, and the worst outcome
/// of a poisoned lock is one unmatched reply.
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

type PendingMap = HashMap<CorrelationId, oneshot::Sender<Bytes>>;

/// Running RPC client instance.
///
/// Cheap to clone (internally `Arc`-backed).
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

struct Inner {
    broker: BrokerPtr,
    reply_queue: String,
    pending: Mutex<PendingMap>,
    rx_task: JoinHandle<()>,
}

impl RpcClient {
    /// Open a client on an established broker connection.
    ///
    /// Declares the private reply queue and starts the receive loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] or [`Error::Broker`] if the reply
    /// queue cannot be declared or consumed.
    pub async fn connect(broker: BrokerPtr) -> Result<Self> {
        // Broker-named so the name is unique to this client.
        let reply_queue = broker.declare_queue("", QueueOptions::ephemeral()).await?;

        // Replies are auto-acked; losing one only costs a timeout.
        let mut handle = broker
            .consume(&reply_queue, ConsumeOptions::default())
            .await?;

        debug!(reply_queue = %reply_queue, "rpc client connected");

        let broker_for_inner = broker.clone();
        let reply_queue_for_inner = reply_queue.clone();

        // Build the Arc first so the receive loop can reach back into the
        // pending map through a weak reference and exit once the last
        // strong handle is dropped.
        let inner = Arc::new_cyclic(|weak: &std::sync::Weak<Inner>| {
            let weak = weak.clone();

            let rx_task = tokio::spawn(async move {
                loop {
                    match handle.inbox.recv().await {
                        Some(delivery) => {
                            let Some(inner) = weak.upgrade() else {
                                break;
                            };
                            fulfill(&inner.pending, delivery.envelope);
                        }
                        None => {
                            debug!("reply subscription closed");
                            break;
                        }
                    }
                }
            });

            Inner {
                broker: broker_for_inner,
                reply_queue: reply_queue_for_inner,
                pending: Mutex::new(PendingMap::new()),
                rx_task,
            }
        });

        Ok(Self { inner })
    }

    /// Issue a call and wait for the correlated reply.
    ///
    /// Publishes `message` to `target_queue` with a fresh correlation id and
    /// this client's reply queue as reply-to, then waits until the reply
    /// arrives or `timeout` elapses. `None` waits without bound.
    ///
    /// On success the returned bytes are the handler's result in canonical
    /// encoding.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] — no reply within `timeout`
    /// - [`Error::Handler`] — the server reported a handler failure
    /// - [`Error::Connection`] / [`Error::Broker`] — publish failed or the
    ///   reply subscription shut down while waiting
    pub async fn call(
        &self,
        message: &Message,
        target_queue: &str,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        let payload = message.encode()?;

        let correlation_id = CorrelationId::generate();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock_ignore_poison(&self.inner.pending);
            pending.insert(correlation_id.clone(), tx);
        }

        let env = Envelope::request(
            target_queue,
            payload,
            correlation_id.clone(),
            self.inner.reply_queue.clone(),
        );

        if let Err(err) = self.inner.broker.publish(env).await {
            self.unregister(&correlation_id);
            return Err(err);
        }

        let raw = match timeout {
            Some(limit) => match time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    // Expired: drop the slot so a straggling reply is not
                    // mistaken for a live call.
                    self.unregister(&correlation_id);
                    return Err(Error::Timeout);
                }
            },
            None => rx.await,
        }
        .map_err(|_| Error::Connection("reply channel closed while waiting".into()))?;

        match Reply::decode(&raw)? {
            Reply::Ok(value) => Ok(Bytes::from(serde_json::to_vec(&value)?)),
            Reply::Err(err) => Err(Error::Handler(err.message)),
        }
    }

    /// Typed convenience over [`call`](Self::call): decodes the result
    /// bytes into `T`.
    pub async fn call_as<T>(
        &self,
        message: &Message,
        target_queue: &str,
        timeout: Option<Duration>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let bytes = self.call(message, target_queue, timeout).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// The name of this client's private reply queue.
    pub fn reply_queue(&self) -> &str {
        &self.inner.reply_queue
    }

    /// Stop the receive loop and fail any outstanding calls.
    ///
    /// The reply queue is auto-deleted once its consumer is gone. The
    /// broker connection itself is shared and stays open.
    pub fn close(&self) {
        self.inner.rx_task.abort();
        let mut pending = lock_ignore_poison(&self.inner.pending);
        // Dropping the senders wakes waiters with a connection error.
        pending.clear();
    }

    fn unregister(&self, correlation_id: &CorrelationId) {
        let mut pending = lock_ignore_poison(&self.inner.pending);
        pending.remove(correlation_id);
    }
}

/// Route one reply envelope to its pending call, if still outstanding.
fn fulfill(pending: &Mutex<PendingMap>, env: Envelope) {
    let Some(correlation_id) = env.correlation_id else {
        warn!("reply without correlation id dropped");
        return;
    };

    let slot = {
        let mut pending = lock_ignore_poison(pending);
        pending.remove(&correlation_id)
    };

    match slot {
        Some(tx) => {
            if tx.send(env.payload).is_err() {
                debug!(%correlation_id, "reply arrived after call was abandoned");
            }
        }
        None => {
            debug!(%correlation_id, "reply for unknown correlation id dropped");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.rx_task.abort();
    }
}
