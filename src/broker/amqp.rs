//! AMQP broker implementation using `lapin`.
//!
//! ## Concurrency model
//!
//! A single background actor task owns the AMQP connection and channel.
//! Queue declaration, publishing, and consumer setup are all serialized
//! through it; no other task touches the connection directly. This keeps
//! the public `Broker` contract (`Send + Sync`) while respecting the AMQP
//! client's connection semantics.
//!
//! ## Wire mapping
//!
//! Envelope metadata rides in AMQP message properties: the correlation id
//! in `correlation_id`, the reply queue in `reply_to`. The payload is
//! published as-is to the default exchange with the queue name as routing
//! key, so the body on the wire is exactly the canonical message encoding
//! and interoperates with any client speaking the same convention.
//!
//! ## Acknowledgement
//!
//! Consumers opened with `manual_ack` get `basic_qos(prefetch)` applied to
//! the channel and must settle each delivery through its [`Delivery`]
//! handle; the RPC server uses this to ack only after the reply is
//! published. Auto-ack consumers (`no_ack`) are settled by the broker on
//! delivery.

use lapin::{
    // ---
    options::{
        BasicAckOptions,
        BasicConsumeOptions,
        BasicNackOptions,
        BasicPublishOptions,
        BasicQosOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::broker::{
    // ---
    AckHandle,
    Broker,
    BrokerPtr,
    ConsumeOptions,
    Delivery,
    Envelope,
    QueueOptions,
    SubscriptionHandle,
};
use crate::correlation::CorrelationId;
use crate::error::{Error, Result};

//
// Actor commands
//

enum Cmd {
    Declare {
        name: String,
        opts: QueueOptions,
        resp: oneshot::Sender<Result<String>>,
    },
    Publish {
        env: Envelope,
        resp: oneshot::Sender<Result<()>>,
    },
    Consume {
        queue: String,
        opts: ConsumeOptions,
        resp: oneshot::Sender<Result<SubscriptionHandle>>,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
}

struct Actor {
    connection_id: String,
    connection: Connection,
    channel: Channel,
    cmd_rx: mpsc::Receiver<Cmd>,
    consumer_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Actor {
    async fn run(mut self) {
        info!("[{}] AMQP actor started", self.connection_id);

        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Cmd::Declare { name, opts, resp } => {
                    let _ = resp.send(self.do_declare(&name, opts).await);
                }
                Cmd::Publish { env, resp } => {
                    let _ = resp.send(self.do_publish(env).await);
                }
                Cmd::Consume { queue, opts, resp } => {
                    let _ = resp.send(self.do_consume(queue, opts).await);
                }
                Cmd::Close { resp } => {
                    let _ = resp.send(Ok(()));
                    break;
                }
            }
        }

        for task in self.consumer_tasks.drain(..) {
            task.abort();
        }

        let _ = self.channel.close(200, "normal shutdown").await;
        let _ = self.connection.close(200, "normal shutdown").await;

        info!("[{}] AMQP actor stopped", self.connection_id);
    }

    async fn do_declare(&mut self, name: &str, opts: QueueOptions) -> Result<String> {
        let declare_opts = QueueDeclareOptions {
            passive: false,
            durable: opts.durable,
            exclusive: opts.exclusive,
            auto_delete: opts.auto_delete,
            nowait: false,
        };

        let queue = self
            .channel
            .queue_declare(name, declare_opts, FieldTable::default())
            .await
            .map_err(|e| Error::Broker(format!("amqp: queue declare failed: {e}")))?;

        let actual = queue.name().as_str().to_string();
        info!("[{}] declared queue: {actual}", self.connection_id);
        Ok(actual)
    }

    async fn do_publish(&mut self, env: Envelope) -> Result<()> {
        let mut props = BasicProperties::default();
        if let Some(corr) = &env.correlation_id {
            props = props.with_correlation_id(corr.to_string().into());
        }
        if let Some(reply_to) = &env.reply_to {
            props = props.with_reply_to(reply_to.clone().into());
        }

        self.channel
            .basic_publish(
                "", // default exchange
                &env.queue,
                BasicPublishOptions::default(),
                &env.payload,
                props,
            )
            .await
            .map_err(|e| Error::Broker(format!("amqp: publish failed: {e}")))?;

        debug!("[{}] published to queue: {}", self.connection_id, env.queue);
        Ok(())
    }

    async fn do_consume(
        &mut self,
        queue: String,
        opts: ConsumeOptions,
    ) -> Result<SubscriptionHandle> {
        if opts.manual_ack && opts.prefetch > 0 {
            self.channel
                .basic_qos(opts.prefetch, BasicQosOptions::default())
                .await
                .map_err(|e| Error::Broker(format!("amqp: qos failed: {e}")))?;
        }

        let consume_opts = BasicConsumeOptions {
            no_ack: !opts.manual_ack,
            ..BasicConsumeOptions::default()
        };

        let consumer = self
            .channel
            .basic_consume(
                &queue,
                &format!("{}-{queue}", self.connection_id),
                consume_opts,
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Broker(format!("amqp: consume failed: {e}")))?;

        info!("[{}] consuming queue: {queue}", self.connection_id);

        let capacity = usize::from(opts.prefetch).max(64);
        let (tx, rx) = mpsc::channel(capacity);
        let connection_id = self.connection_id.clone();
        let manual_ack = opts.manual_ack;

        let task = tokio::spawn(async move {
            use futures_lite::stream::StreamExt;

            let mut consumer = consumer;
            while let Some(delivery_result) = consumer.next().await {
                let delivery = match delivery_result {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        error!("[{connection_id}] consumer error on {queue}: {e}");
                        break;
                    }
                };

                let props = &delivery.properties;
                let envelope = Envelope {
                    queue: queue.clone(),
                    payload: Bytes::from(delivery.data.clone()),
                    correlation_id: props
                        .correlation_id()
                        .as_ref()
                        .map(|s| CorrelationId::from(s.as_str())),
                    reply_to: props.reply_to().as_ref().map(|s| s.as_str().to_string()),
                };

                let acker: Option<Box<dyn AckHandle>> = manual_ack
                    .then(|| Box::new(AmqpAck(delivery.acker)) as Box<dyn AckHandle>);

                if tx.send(Delivery::new(envelope, acker)).await.is_err() {
                    // Subscription handle dropped.
                    debug!("[{connection_id}] subscriber gone, ending consumer for {queue}");
                    break;
                }
            }

            debug!("[{connection_id}] consumer task ended for queue: {queue}");
        });

        self.consumer_tasks.push(task);

        Ok(SubscriptionHandle { inbox: rx })
    }
}

struct AmqpAck(lapin::acker::Acker);

#[async_trait::async_trait]
impl AckHandle for AmqpAck {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| Error::Broker(format!("amqp: ack failed: {e}")))
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(|e| Error::Broker(format!("amqp: nack failed: {e}")))
    }
}

/// AMQP broker handle backed by the background actor.
pub struct AmqpBroker {
    cmd_tx: mpsc::Sender<Cmd>,
}

impl AmqpBroker {
    async fn send(&self, cmd: Cmd) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| Error::Connection("amqp broker closed".into()))
    }
}

#[async_trait::async_trait]
impl Broker for AmqpBroker {
    async fn declare_queue(&self, name: &str, opts: QueueOptions) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.send(Cmd::Declare {
            name: name.to_string(),
            opts,
            resp: tx,
        })
        .await?;
        rx.await
            .map_err(|_| Error::Connection("amqp broker closed".into()))?
    }

    async fn publish(&self, env: Envelope) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Cmd::Publish { env, resp: tx }).await?;
        rx.await
            .map_err(|_| Error::Connection("amqp broker closed".into()))?
    }

    async fn consume(&self, queue: &str, opts: ConsumeOptions) -> Result<SubscriptionHandle> {
        let (tx, rx) = oneshot::channel();
        self.send(Cmd::Consume {
            queue: queue.to_string(),
            opts,
            resp: tx,
        })
        .await?;
        rx.await
            .map_err(|_| Error::Connection("amqp broker closed".into()))?
    }

    async fn close(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.send(Cmd::Close { resp: tx }).await.is_ok() {
            let _ = rx.await;
        }
        Ok(())
    }
}

/// Connect to an AMQP broker and return a [`BrokerPtr`] for it.
///
/// The connection is established eagerly; an unreachable broker surfaces as
/// [`Error::Connection`] here rather than on first use.
pub async fn create_amqp_broker(uri: &str, connection_id: &str) -> Result<BrokerPtr> {
    info!("connecting to AMQP broker: {uri}");

    let connection = Connection::connect(uri, ConnectionProperties::default())
        .await
        .map_err(|e| {
            let msg = format!("amqp: connection failed: {e}");
            warn!("{msg}");
            Error::Connection(msg)
        })?;

    let channel = connection
        .create_channel()
        .await
        .map_err(|e| Error::Connection(format!("amqp: channel creation failed: {e}")))?;

    info!("connected to AMQP broker");

    let (cmd_tx, cmd_rx) = mpsc::channel(32);

    let actor = Actor {
        connection_id: connection_id.to_string(),
        connection,
        channel,
        cmd_rx,
        consumer_tasks: Vec::new(),
    };

    tokio::spawn(actor.run());

    Ok(std::sync::Arc::new(AmqpBroker { cmd_tx }))
}
