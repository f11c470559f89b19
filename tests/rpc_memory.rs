// tests/rpc_memory.rs
//
// End-to-end RPC behavior over the in-memory broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::{json, Value};

use queue_rpc::{
    // ---
    create_memory_broker,
    Broker,
    BrokerPtr,
    ConsumeOptions,
    CorrelationId,
    Envelope,
    Error,
    FieldType,
    Fields,
    Message,
    QueueOptions,
    Result,
    RpcClient,
    RpcServer,
    Schema,
    ServerOptions,
    SubscriptionHandle,
};

fn add_schema() -> Schema {
    Schema::new("add")
        .field("x", FieldType::Int)
        .field("y", FieldType::Int)
}

fn fields(pairs: &[(&str, Value)]) -> Fields {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Test fixture: an adding server consuming `queue`.
struct AddServer {
    server: RpcServer,
    broker: BrokerPtr,
}

impl AddServer {
    async fn start(queue: &str) -> Result<Self> {
        let broker = create_memory_broker().await?;

        let options = ServerOptions {
            schema: Some(add_schema()),
            ..ServerOptions::default()
        };

        let server = RpcServer::start(broker.clone(), queue, options, |fields| async move {
            let x = fields["x"].as_i64().expect("validated int");
            let y = fields["y"].as_i64().expect("validated int");
            Ok(Value::from(x + y))
        })
        .await?;

        Ok(Self { server, broker })
    }

    fn broker(&self) -> BrokerPtr {
        self.broker.clone()
    }

    async fn shutdown(self) {
        self.server.stop().await;
    }
}

/// Broker wrapper that fails the next `reply_failures` response publishes.
struct FlakyReplyBroker {
    inner: BrokerPtr,
    reply_failures: AtomicUsize,
}

#[async_trait::async_trait]
impl Broker for FlakyReplyBroker {
    async fn declare_queue(&self, name: &str, opts: QueueOptions) -> Result<String> {
        self.inner.declare_queue(name, opts).await
    }

    async fn publish(&self, env: Envelope) -> Result<()> {
        // Responses carry no reply-to; requests pass through untouched.
        if env.reply_to.is_none() && self.reply_failures.load(Ordering::SeqCst) > 0 {
            self.reply_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Broker("reply publish dropped".into()));
        }
        self.inner.publish(env).await
    }

    async fn consume(&self, queue: &str, opts: ConsumeOptions) -> Result<SubscriptionHandle> {
        self.inner.consume(queue, opts).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn add_three_and_five_returns_eight() -> Result<()> {
    // ---
    let fixture = AddServer::start("add").await?;
    let client = RpcClient::connect(fixture.broker()).await?;

    let message = Message::new(&add_schema(), fields(&[("x", json!(3)), ("y", json!(5))]))?;
    let raw = client
        .call(&message, "add", Some(Duration::from_secs(5)))
        .await?;
    assert_eq!(&raw[..], b"8");

    let sum: i64 = client
        .call_as(&message, "add", Some(Duration::from_secs(5)))
        .await?;
    assert_eq!(sum, 8);

    fixture.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn timeout_fires_at_or_after_deadline() -> Result<()> {
    // ---
    let broker = create_memory_broker().await?;
    let client = RpcClient::connect(broker).await?;

    let message = Message::new(&add_schema(), fields(&[("x", json!(1)), ("y", json!(2))]))?;

    let timeout = Duration::from_millis(300);
    let started = Instant::now();
    let err = client
        .call(&message, "nobody-consumes-this", Some(timeout))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, Error::Timeout), "got {err:?}");
    assert!(elapsed >= timeout, "timed out early: {elapsed:?}");
    Ok(())
}

#[tokio::test]
async fn two_clients_each_receive_their_own_response() -> Result<()> {
    // ---
    let fixture = AddServer::start("add").await?;

    let alice = RpcClient::connect(fixture.broker()).await?;
    let bob = RpcClient::connect(fixture.broker()).await?;

    let alice_msg = Message::new(&add_schema(), fields(&[("x", json!(10)), ("y", json!(1))]))?;
    let bob_msg = Message::new(&add_schema(), fields(&[("x", json!(20)), ("y", json!(2))]))?;

    let timeout = Some(Duration::from_secs(5));
    let (alice_sum, bob_sum) = tokio::join!(
        alice.call_as::<i64>(&alice_msg, "add", timeout),
        bob.call_as::<i64>(&bob_msg, "add", timeout),
    );

    assert_eq!(alice_sum?, 11);
    assert_eq!(bob_sum?, 22);

    fixture.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn concurrent_calls_from_one_client_do_not_cross() -> Result<()> {
    // ---
    let fixture = AddServer::start("add").await?;
    let client = RpcClient::connect(fixture.broker()).await?;

    let timeout = Some(Duration::from_secs(5));
    let mut tasks = Vec::new();

    for i in 0..10i64 {
        let c = client.clone();
        tasks.push(tokio::spawn(async move {
            let msg = Message::new(
                &add_schema(),
                fields(&[("x", json!(i)), ("y", json!(i))]),
            )?;
            c.call_as::<i64>(&msg, "add", timeout).await
        }));
    }

    for (i, task) in tasks.into_iter().enumerate() {
        let sum = task.await.expect("task panicked")?;
        assert_eq!(sum, 2 * i as i64);
    }

    fixture.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn prefetch_one_never_overlaps_handler_invocations() -> Result<()> {
    // ---
    let broker = create_memory_broker().await?;

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let handler_active = active.clone();
    let handler_peak = peak.clone();

    let server = RpcServer::start(
        broker.clone(),
        "slow",
        ServerOptions::default(),
        move |_fields| {
            let active = handler_active.clone();
            let peak = handler_peak.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::from(true))
            }
        },
    )
    .await?;

    let schema = Schema::new("slow");
    let message = Message::new(&schema, Fields::new())?;
    let timeout = Some(Duration::from_secs(5));

    let a = RpcClient::connect(broker.clone()).await?;
    let b = RpcClient::connect(broker.clone()).await?;
    let c = RpcClient::connect(broker).await?;

    let (ra, rb, rc) = tokio::join!(
        a.call(&message, "slow", timeout),
        b.call(&message, "slow", timeout),
        c.call(&message, "slow", timeout),
    );
    ra?;
    rb?;
    rc?;

    assert_eq!(peak.load(Ordering::SeqCst), 1, "handlers overlapped");

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn handler_failure_reaches_caller_as_handler_error() -> Result<()> {
    // ---
    let broker = create_memory_broker().await?;

    let server = RpcServer::start(
        broker.clone(),
        "flaky",
        ServerOptions::default(),
        |_fields| async move { Err::<Value, _>(Error::Handler("boom".into())) },
    )
    .await?;

    let client = RpcClient::connect(broker).await?;
    let message = Message::new(&Schema::new("flaky"), Fields::new())?;

    let err = client
        .call(&message, "flaky", Some(Duration::from_secs(5)))
        .await
        .unwrap_err();

    match err {
        Error::Handler(msg) => assert!(msg.contains("boom"), "got: {msg}"),
        other => panic!("expected Handler error, got {other:?}"),
    }

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn server_side_validation_failure_is_reported_not_hung() -> Result<()> {
    // ---
    let fixture = AddServer::start("add").await?;
    let client = RpcClient::connect(fixture.broker()).await?;

    // A schema loose enough to let a mistyped request through on the
    // client side; the server's stricter schema must reject it.
    let loose = Schema::new("add")
        .field("x", FieldType::Str)
        .field("y", FieldType::Int);
    let message = Message::new(&loose, fields(&[("x", json!("three")), ("y", json!(5))]))?;

    let err = client
        .call(&message, "add", Some(Duration::from_secs(5)))
        .await
        .unwrap_err();

    match err {
        Error::Handler(msg) => assert!(msg.contains("expected int"), "got: {msg}"),
        other => panic!("expected Handler error, got {other:?}"),
    }

    fixture.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn stop_lets_in_flight_invocation_finish_and_reply() -> Result<()> {
    // ---
    let broker = create_memory_broker().await?;

    let server = RpcServer::start(
        broker.clone(),
        "slow",
        ServerOptions::default(),
        |_fields| async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            Ok(Value::from("done"))
        },
    )
    .await?;

    let client = RpcClient::connect(broker).await?;
    let message = Message::new(&Schema::new("slow"), Fields::new())?;

    let call = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .call(&message, "slow", Some(Duration::from_secs(5)))
                .await
        }
    });

    // Let the handler get in flight, then stop mid-invocation.
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.stop().await;

    let raw = call.await.expect("call task panicked")?;
    assert_eq!(&raw[..], br#""done""#);
    Ok(())
}

#[tokio::test]
async fn failed_reply_publish_requeues_the_request() -> Result<()> {
    // ---
    let inner = create_memory_broker().await?;
    let flaky: BrokerPtr = Arc::new(FlakyReplyBroker {
        inner: inner.clone(),
        reply_failures: AtomicUsize::new(1),
    });

    let options = ServerOptions {
        schema: Some(add_schema()),
        ..ServerOptions::default()
    };
    let server = RpcServer::start(flaky, "add", options, |fields| async move {
        let x = fields["x"].as_i64().expect("validated int");
        let y = fields["y"].as_i64().expect("validated int");
        Ok(Value::from(x + y))
    })
    .await?;

    let client = RpcClient::connect(inner).await?;
    let message = Message::new(&add_schema(), fields(&[("x", json!(3)), ("y", json!(5))]))?;

    // The first attempt loses its reply; the delivery must be requeued and
    // answered on redelivery rather than pinning the prefetch window.
    let sum: i64 = client
        .call_as(&message, "add", Some(Duration::from_secs(5)))
        .await?;
    assert_eq!(sum, 8);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn stray_reply_with_unknown_correlation_id_is_ignored() -> Result<()> {
    // ---
    let fixture = AddServer::start("add").await?;
    let client = RpcClient::connect(fixture.broker()).await?;

    let stray = Envelope::response(
        client.reply_queue(),
        Bytes::from_static(br#"{"ok":99}"#),
        CorrelationId::generate(),
    );
    fixture.broker().publish(stray).await?;

    // The receive loop must drop it and keep matching real replies.
    let message = Message::new(&add_schema(), fields(&[("x", json!(3)), ("y", json!(5))]))?;
    let sum: i64 = client
        .call_as(&message, "add", Some(Duration::from_secs(5)))
        .await?;
    assert_eq!(sum, 8);

    fixture.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn late_reply_after_timeout_does_not_fulfill_the_next_call() -> Result<()> {
    // ---
    let broker = create_memory_broker().await?;

    let server = RpcServer::start(
        broker.clone(),
        "echo-slow",
        ServerOptions::default(),
        |fields| async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok(fields["tag"].clone())
        },
    )
    .await?;

    let client = RpcClient::connect(broker).await?;
    let schema = Schema::new("echo").field("tag", FieldType::Str);

    let first = Message::new(&schema, fields(&[("tag", json!("first"))]))?;
    let err = client
        .call(&first, "echo-slow", Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout), "got {err:?}");

    // The straggler for the first call arrives while the second waits; it
    // must not be mistaken for the second call's reply.
    let second = Message::new(&schema, fields(&[("tag", json!("second"))]))?;
    let tag: String = client
        .call_as(&second, "echo-slow", Some(Duration::from_secs(5)))
        .await?;
    assert_eq!(tag, "second");

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn unanswerable_delivery_is_discarded_and_serving_continues() -> Result<()> {
    // ---
    let fixture = AddServer::start("add").await?;

    // No correlation id, no reply-to: nothing to answer, nothing to requeue.
    let bare = Envelope {
        queue: "add".to_string(),
        payload: Bytes::from_static(br#"{"x":1,"y":2}"#),
        correlation_id: None,
        reply_to: None,
    };
    fixture.broker().publish(bare).await?;

    // With prefetch 1, an unsettled delivery would starve this call.
    let client = RpcClient::connect(fixture.broker()).await?;
    let message = Message::new(&add_schema(), fields(&[("x", json!(3)), ("y", json!(5))]))?;
    let sum: i64 = client
        .call_as(&message, "add", Some(Duration::from_secs(5)))
        .await?;
    assert_eq!(sum, 8);

    fixture.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn stop_does_not_start_buffered_requests() -> Result<()> {
    // ---
    let broker = create_memory_broker().await?;

    let started = Arc::new(AtomicUsize::new(0));
    let handler_started = started.clone();

    let server = RpcServer::start(
        broker.clone(),
        "slow",
        ServerOptions::default(),
        move |_fields| {
            let started = handler_started.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(Value::from(true))
            }
        },
    )
    .await?;

    for _ in 0..3 {
        let env = Envelope::request(
            "slow",
            Bytes::from_static(b"{}"),
            CorrelationId::generate(),
            "replies",
        );
        broker.publish(env).await?;
    }

    // Let the first request get in flight, then stop; the buffered requests
    // must never reach the handler.
    tokio::time::sleep(Duration::from_millis(30)).await;
    server.stop().await;

    assert_eq!(started.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn typed_handler_round_trips_structs() -> Result<()> {
    // ---
    use serde::{Deserialize, Serialize};

    #[derive(Deserialize)]
    struct AddRequest {
        x: i64,
        y: i64,
    }

    #[derive(Serialize)]
    struct AddResponse {
        sum: i64,
    }

    let broker = create_memory_broker().await?;

    let server = RpcServer::start(
        broker.clone(),
        "add-typed",
        ServerOptions::default(),
        queue_rpc::server::typed(|req: AddRequest| async move {
            Ok(AddResponse { sum: req.x + req.y })
        }),
    )
    .await?;

    let client = RpcClient::connect(broker).await?;
    let message = Message::new(&add_schema(), fields(&[("x", json!(2)), ("y", json!(3))]))?;

    let resp: Value = client
        .call_as(&message, "add-typed", Some(Duration::from_secs(5)))
        .await?;
    assert_eq!(resp, json!({"sum": 5}));

    server.stop().await;
    Ok(())
}
