use queue_rpc::{
    create_broker, Broker, FieldType, Message, Result, RpcClient, RpcConfig, RpcServer, Schema,
    ServerOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct AddRequest {
    a: i64,
    b: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct AddResponse {
    sum: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt::init();

    let broker = create_broker(&RpcConfig::memory("math")).await?;

    let server = RpcServer::start(
        broker.clone(),
        "math.add",
        ServerOptions::default(),
        queue_rpc::server::typed(|req: AddRequest| async move {
            Ok(AddResponse { sum: req.a + req.b })
        }),
    )
    .await?;

    let schema = Schema::new("add")
        .field("a", FieldType::Int)
        .field("b", FieldType::Int);

    let message = Message::new(
        &schema,
        [("a".to_string(), json!(20)), ("b".to_string(), json!(3))]
            .into_iter()
            .collect(),
    )?;

    let client = RpcClient::connect(broker.clone()).await?;

    let resp: AddResponse = client
        .call_as(&message, "math.add", Some(Duration::from_secs(5)))
        .await?;

    println!("20 + 3 = {}", resp.sum);

    server.stop().await;
    client.close();
    broker.close().await?;
    Ok(())
}
