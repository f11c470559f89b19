//! RPC server implementation.
//!
//! The server consumes a durable work queue with a prefetch limit (default
//! one unacknowledged delivery) and feeds each request body, decoded into a
//! field map, to the registered handler. The handler's result is published
//! back to the request's reply-to queue under the originating correlation
//! id, and only then is the delivery acknowledged — a crash mid-handling
//! leaves the request unacked for broker redelivery.
//!
//! Handler failures do not crash the loop and do not trigger redelivery:
//! they are reported to the caller as a structured error reply, and the
//! delivery is acked.

use std::future::Future;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerPtr, ConsumeOptions, Delivery, Envelope, QueueOptions};
use crate::error::{Error, Result};
use crate::schema::{self, Fields, Reply, Schema};

/// Server tuning knobs.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Maximum unacknowledged deliveries held at once. The default of 1
    /// makes handling strictly sequential.
    pub prefetch: u16,

    /// When set, decoded request bodies are validated against this schema
    /// before the handler runs; invalid requests get an error reply.
    pub schema: Option<Schema>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            prefetch: 1,
            schema: None,
        }
    }
}

type BoxFuture<T> = std::pin::Pin<Box<dyn Future<Output = T> + Send>>;

/// Running RPC server instance.
pub struct RpcServer {
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    queue: String,
}

impl RpcServer {
    /// Declare `queue` (durable, created if absent), start consuming it,
    /// and dispatch requests to `handler`.
    ///
    /// The handler receives the request's field map and returns the value
    /// to send back. Any `Err` it returns becomes an error reply for the
    /// caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] or [`Error::Broker`] if the queue
    /// cannot be declared or consumed.
    pub async fn start<F, Fut>(
        broker: BrokerPtr,
        queue: &str,
        options: ServerOptions,
        handler: F,
    ) -> Result<Self>
    where
        F: Fn(Fields) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let queue = broker.declare_queue(queue, QueueOptions::durable()).await?;

        let consume = ConsumeOptions {
            manual_ack: true,
            prefetch: options.prefetch,
        };
        let mut sub = broker.consume(&queue, consume).await?;

        info!(queue = %queue, prefetch = options.prefetch, "rpc server started");

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let schema = options.schema;
        let loop_queue = queue.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    // Shutdown wins over any already-buffered delivery, so
                    // stop() is deterministic.
                    biased;

                    _ = &mut shutdown_rx => {
                        debug!(queue = %loop_queue, "shutdown requested");
                        break;
                    }
                    next = sub.inbox.recv() => {
                        let Some(delivery) = next else {
                            debug!(queue = %loop_queue, "work queue subscription closed");
                            break;
                        };
                        // Awaited to completion before the next delivery is
                        // taken; a shutdown signal arriving mid-request is
                        // observed only after the reply and ack go out.
                        if let Err(err) = serve_one(&broker, &handler, schema.as_ref(), delivery).await {
                            warn!(queue = %loop_queue, error = %err, "failed to serve request");
                        }
                    }
                }
            }

            info!(queue = %loop_queue, "rpc server stopped");
        });

        Ok(Self {
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
            queue,
        })
    }

    /// The work queue this server consumes.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Halt consumption and wait for the loop to exit.
    ///
    /// An in-flight handler invocation is allowed to finish, reply, and
    /// acknowledge before the loop stops. Idempotent.
    pub async fn stop(&self) {
        // Poisoning is harmless here: both fields are take-once handles.
        let shutdown_tx = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(tx) = shutdown_tx {
            let _ = tx.send(());
        }

        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Handle one delivery end to end: decode, validate, invoke, reply, ack.
async fn serve_one<F, Fut>(
    broker: &BrokerPtr,
    handler: &F,
    schema: Option<&Schema>,
    mut delivery: Delivery,
) -> Result<()>
where
    F: Fn(Fields) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    let env = &delivery.envelope;

    // Without both metadata fields there is nowhere to send an answer;
    // requeueing would loop the same request forever.
    let (Some(correlation_id), Some(reply_to)) = (env.correlation_id.clone(), env.reply_to.clone())
    else {
        delivery.reject(false).await?;
        return Err(Error::InvalidEnvelope(
            "request missing correlation id or reply-to".into(),
        ));
    };

    let reply = match decode_and_validate(&env.payload, schema) {
        Ok(fields) => match handler(fields).await {
            Ok(value) => Reply::Ok(value),
            Err(err) => {
                debug!(%correlation_id, error = %err, "handler returned an error");
                Reply::from_error(err)
            }
        },
        Err(err) => Reply::from_error(err),
    };

    let sent = match reply.encode() {
        Ok(payload) => {
            broker
                .publish(Envelope::response(reply_to, payload, correlation_id))
                .await
        }
        Err(err) => Err(err),
    };
    if let Err(err) = sent {
        // The reply never left. Requeue so a later attempt can answer it;
        // leaving the delivery unsettled would pin the prefetch window.
        delivery.reject(true).await?;
        return Err(err);
    }

    // Ack strictly after the reply is out: a crash above redelivers the
    // request instead of silently dropping its outcome.
    delivery.ack().await
}

fn decode_and_validate(payload: &[u8], schema: Option<&Schema>) -> Result<Fields> {
    let fields = schema::decode_fields(payload)?;
    if let Some(schema) = schema {
        schema.validate(&fields)?;
    }
    Ok(fields)
}

/// Adapt a typed handler to the field-map calling convention.
///
/// The wrapped function takes the request deserialized into `Req` and
/// returns a serializable `Resp`; serde failures on either side surface as
/// error replies.
///
/// ```
/// use queue_rpc::server::typed;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Deserialize)]
/// struct AddRequest { x: i64, y: i64 }
///
/// #[derive(Serialize)]
/// struct AddResponse { sum: i64 }
///
/// let handler = typed(|req: AddRequest| async move {
///     Ok(AddResponse { sum: req.x + req.y })
/// });
/// # let _ = handler;
/// ```
pub fn typed<F, Fut, Req, Resp>(
    handler: F,
) -> impl Fn(Fields) -> BoxFuture<Result<Value>> + Send + Sync + 'static
where
    F: Fn(Req) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    move |fields: Fields| {
        let handler = handler.clone();
        Box::pin(async move {
            let req: Req = serde_json::from_value(Value::Object(
                fields.into_iter().collect(),
            ))?;
            let resp = handler(req).await?;
            Ok(serde_json::to_value(resp)?)
        }) as BoxFuture<Result<Value>>
    }
}
