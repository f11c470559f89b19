//! In-memory broker implementation.
//!
//! A pure in-process backend with real queue semantics: declared queues
//! buffer envelopes while nobody consumes, competing consumers are served
//! round-robin, and manual-ack consumers never hold more than `prefetch`
//! unacknowledged deliveries. It is the reference implementation the AMQP
//! backend is expected to approximate, and what tests run against.
//!
//! ## Concurrency model
//!
//! A single background actor task owns all queue state. Every operation is
//! a command sent to the actor over a channel, so no locks guard the queue
//! map and command handling is strictly serialized.
//!
//! ## Non-goals
//!
//! Persistence, network failure simulation, and exact emulation of any
//! specific broker product.

use std::collections::{HashMap, VecDeque};

use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

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
    Ack {
        queue: String,
        consumer: u64,
        tag: u64,
    },
    Reject {
        queue: String,
        consumer: u64,
        tag: u64,
        requeue: bool,
    },
    /// Re-attempt delivery on a queue. Sent by waiters once a previously
    /// full consumer inbox has room again.
    Drain {
        queue: String,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
}

struct Consumer {
    id: u64,
    tx: mpsc::Sender<Delivery>,
    manual_ack: bool,
    prefetch: u16,
    /// Delivery tag → envelope, for redelivery when a consumer rejects or
    /// disappears with work outstanding.
    in_flight: HashMap<u64, Envelope>,
}

impl Consumer {
    fn has_capacity(&self) -> bool {
        if !self.manual_ack || self.prefetch == 0 {
            return true;
        }
        self.in_flight.len() < usize::from(self.prefetch)
    }
}

struct QueueState {
    opts: QueueOptions,
    backlog: VecDeque<Envelope>,
    consumers: Vec<Consumer>,
    /// Round-robin cursor over `consumers`.
    cursor: usize,
}

struct Actor {
    cmd_rx: mpsc::Receiver<Cmd>,
    cmd_tx: mpsc::Sender<Cmd>,
    queues: HashMap<String, QueueState>,
    next_consumer_id: u64,
    next_tag: u64,
}

impl Actor {
    async fn run(mut self) {
        debug!("memory broker actor started");

        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Cmd::Declare { name, opts, resp } => {
                    let _ = resp.send(Ok(self.declare(name, opts)));
                }
                Cmd::Publish { env, resp } => {
                    self.publish(env);
                    let _ = resp.send(Ok(()));
                }
                Cmd::Consume { queue, opts, resp } => {
                    let _ = resp.send(self.consume(&queue, opts));
                }
                Cmd::Ack {
                    queue,
                    consumer,
                    tag,
                } => {
                    self.settle(&queue, consumer, tag, None);
                }
                Cmd::Reject {
                    queue,
                    consumer,
                    tag,
                    requeue,
                } => {
                    self.settle(&queue, consumer, tag, Some(requeue));
                }
                Cmd::Drain { queue } => {
                    self.drain(&queue);
                }
                Cmd::Close { resp } => {
                    let _ = resp.send(Ok(()));
                    break;
                }
            }
        }

        debug!("memory broker actor stopped");
    }

    fn declare(&mut self, name: String, opts: QueueOptions) -> String {
        let name = if name.is_empty() {
            format!("gen-{}", Uuid::new_v4().simple())
        } else {
            name
        };

        self.queues.entry(name.clone()).or_insert_with(|| {
            debug!(queue = %name, "declared queue");
            QueueState {
                opts,
                backlog: VecDeque::new(),
                consumers: Vec::new(),
                cursor: 0,
            }
        });

        name
    }

    fn publish(&mut self, env: Envelope) {
        let queue = env.queue.clone();
        match self.queues.get_mut(&queue) {
            Some(state) => {
                state.backlog.push_back(env);
                self.drain(&queue);
            }
            None => {
                // Default-exchange semantics: unroutable messages vanish.
                debug!(queue = %queue, "dropping envelope for undeclared queue");
            }
        }
    }

    fn consume(&mut self, queue: &str, opts: ConsumeOptions) -> Result<SubscriptionHandle> {
        let state = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| Error::Broker(format!("cannot consume undeclared queue '{queue}'")))?;

        let capacity = usize::from(opts.prefetch).max(64);
        let (tx, rx) = mpsc::channel(capacity);

        self.next_consumer_id += 1;
        state.consumers.push(Consumer {
            id: self.next_consumer_id,
            tx,
            manual_ack: opts.manual_ack,
            prefetch: opts.prefetch,
            in_flight: HashMap::new(),
        });

        debug!(queue = %queue, consumer = self.next_consumer_id, "consumer attached");
        self.drain(queue);

        Ok(SubscriptionHandle { inbox: rx })
    }

    fn settle(&mut self, queue: &str, consumer: u64, tag: u64, requeue: Option<bool>) {
        if let Some(state) = self.queues.get_mut(queue) {
            if let Some(c) = state.consumers.iter_mut().find(|c| c.id == consumer) {
                if let Some(env) = c.in_flight.remove(&tag) {
                    if requeue == Some(true) {
                        state.backlog.push_front(env);
                    }
                }
            }
            self.drain(queue);
        }
    }

    /// Hand backlogged envelopes to consumers with capacity, round-robin.
    fn drain(&mut self, queue: &str) {
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };

        let mut dead: Vec<u64> = Vec::new();

        'outer: while !state.backlog.is_empty() {
            let total = state.consumers.len();
            if total == 0 {
                break;
            }

            // One full rotation looking for a consumer that can take the
            // head of the backlog.
            for _ in 0..total {
                let idx = state.cursor % total;
                state.cursor = state.cursor.wrapping_add(1);

                let consumer = &mut state.consumers[idx];
                if dead.contains(&consumer.id) || !consumer.has_capacity() {
                    continue;
                }

                let env = state.backlog.pop_front().expect("backlog non-empty");
                self.next_tag += 1;
                let tag = self.next_tag;

                let acker: Option<Box<dyn AckHandle>> = consumer.manual_ack.then(|| {
                    Box::new(MemoryAck {
                        cmd_tx: self.cmd_tx.clone(),
                        queue: queue.to_string(),
                        consumer: consumer.id,
                        tag,
                    }) as Box<dyn AckHandle>
                });

                if consumer.manual_ack {
                    consumer.in_flight.insert(tag, env.clone());
                }

                match consumer.tx.try_send(Delivery::new(env, acker)) {
                    Ok(()) => continue 'outer,
                    Err(mpsc::error::TrySendError::Full(delivery)) => {
                        // Inbox full: put the envelope back and try the
                        // next consumer. A waiter re-triggers this queue's
                        // drain once the subscriber frees a slot, so the
                        // backlog does not sit until the next publish.
                        consumer.in_flight.remove(&tag);
                        state.backlog.push_front(delivery.envelope);

                        let slot_tx = consumer.tx.clone();
                        let cmd_tx = self.cmd_tx.clone();
                        let queue = queue.to_string();
                        tokio::spawn(async move {
                            if slot_tx.reserve().await.is_ok() {
                                let _ = cmd_tx.send(Cmd::Drain { queue }).await;
                            }
                        });
                    }
                    Err(mpsc::error::TrySendError::Closed(delivery)) => {
                        // Subscription handle dropped.
                        consumer.in_flight.remove(&tag);
                        state.backlog.push_front(delivery.envelope);
                        dead.push(consumer.id);
                    }
                }
            }

            // Nobody could take the head; stop until capacity frees up.
            break;
        }

        if !dead.is_empty() {
            for id in &dead {
                if let Some(pos) = state.consumers.iter().position(|c| c.id == *id) {
                    let gone = state.consumers.remove(pos);
                    // Unacked work from a vanished consumer is redelivered.
                    for (_, env) in gone.in_flight {
                        state.backlog.push_front(env);
                    }
                    debug!(queue = %queue, consumer = id, "consumer detached");
                }
            }
            state.cursor = 0;

            if state.opts.auto_delete && state.consumers.is_empty() {
                debug!(queue = %queue, "auto-deleting queue");
                self.queues.remove(queue);
            }
        }
    }
}

struct MemoryAck {
    cmd_tx: mpsc::Sender<Cmd>,
    queue: String,
    consumer: u64,
    tag: u64,
}

#[async_trait::async_trait]
impl AckHandle for MemoryAck {
    async fn ack(self: Box<Self>) -> Result<()> {
        // A closed command channel means the broker is gone; nothing left
        // to settle against.
        let _ = self
            .cmd_tx
            .send(Cmd::Ack {
                queue: self.queue,
                consumer: self.consumer,
                tag: self.tag,
            })
            .await;
        Ok(())
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<()> {
        let _ = self
            .cmd_tx
            .send(Cmd::Reject {
                queue: self.queue,
                consumer: self.consumer,
                tag: self.tag,
                requeue,
            })
            .await;
        Ok(())
    }
}

/// In-memory broker handle. Cheap to clone; all clones talk to the same
/// actor.
pub struct MemoryBroker {
    cmd_tx: mpsc::Sender<Cmd>,
}

impl MemoryBroker {
    async fn send(&self, cmd: Cmd) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| Error::Connection("memory broker closed".into()))
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn declare_queue(&self, name: &str, opts: QueueOptions) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.send(Cmd::Declare {
            name: name.to_string(),
            opts,
            resp: tx,
        })
        .await?;
        rx.await
            .map_err(|_| Error::Connection("memory broker closed".into()))?
    }

    async fn publish(&self, env: Envelope) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Cmd::Publish { env, resp: tx }).await?;
        rx.await
            .map_err(|_| Error::Connection("memory broker closed".into()))?
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
            .map_err(|_| Error::Connection("memory broker closed".into()))?
    }

    async fn close(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        // Already closed is fine.
        if self.send(Cmd::Close { resp: tx }).await.is_ok() {
            let _ = rx.await;
        }
        Ok(())
    }
}

/// Create a new in-memory broker.
///
/// Always available; needs no external resources.
pub async fn create_memory_broker() -> Result<BrokerPtr> {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);

    let actor = Actor {
        cmd_rx,
        cmd_tx: cmd_tx.clone(),
        queues: HashMap::new(),
        next_consumer_id: 0,
        next_tag: 0,
    };

    tokio::spawn(actor.run());

    Ok(std::sync::Arc::new(MemoryBroker { cmd_tx }))
}
