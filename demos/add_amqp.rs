//! End-to-end demo against a real AMQP broker.
//!
//! Start a broker first, e.g.:
//!
//!     docker run --rm -p 5672:5672 rabbitmq:3
//!     cargo run --example add_amqp

use queue_rpc::{
    create_broker, Broker, FieldType, Message, Result, RpcClient, RpcConfig, RpcServer, Schema,
    ServerOptions,
};
use serde_json::json;
use std::time::Duration;

const BROKER_URI: &str = "amqp://127.0.0.1:5672/%2f";

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt::init();

    let server_broker = create_broker(&RpcConfig::with_broker(BROKER_URI, "demo-server")).await?;
    let client_broker = create_broker(&RpcConfig::with_broker(BROKER_URI, "demo-client")).await?;

    let schema = Schema::new("add")
        .field("a", FieldType::Int)
        .field("b", FieldType::Int);

    let options = ServerOptions {
        schema: Some(schema.clone()),
        ..ServerOptions::default()
    };

    let server = RpcServer::start(
        server_broker.clone(),
        "math.add",
        options,
        |fields| async move {
            let a = fields["a"].as_i64().unwrap_or(0);
            let b = fields["b"].as_i64().unwrap_or(0);
            Ok(serde_json::Value::from(a + b))
        },
    )
    .await?;

    let client = RpcClient::connect(client_broker.clone()).await?;

    let message = Message::new(
        &schema,
        [("a".to_string(), json!(20)), ("b".to_string(), json!(3))]
            .into_iter()
            .collect(),
    )?;

    let sum: i64 = client
        .call_as(&message, "math.add", Some(Duration::from_secs(10)))
        .await?;
    println!("20 + 3 = {sum}");

    server.stop().await;
    client.close();
    client_broker.close().await?;
    server_broker.close().await?;
    Ok(())
}
