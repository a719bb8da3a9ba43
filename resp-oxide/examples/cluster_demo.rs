//! Connects to a server or cluster, runs a few commands and prints lifecycle events
//!
//! ```text
//! REDIS_URL=redis://127.0.0.1:7000 RUST_LOG=resp_oxide=debug cargo run --example cluster_demo
//! ```

use resp_oxide::{cmd, Client, ConnectionConfig, ReadPolicy, Script};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let config = ConnectionConfig::new(url).with_read_policy(ReadPolicy::Replica);
    let client = Client::connect(config).await?;
    println!("Connected ({})", if client.is_cluster() { "cluster" } else { "standalone" });

    let mut events = client.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("event: {event}");
        }
    });

    client.set("demo:key", "Hello, resp-oxide!").await?;
    println!("GET demo:key = {:?}", client.get("demo:key").await?);

    let mut pipeline = client.pipeline();
    for i in 0..5 {
        pipeline.incr_by("{demo}counter", i);
    }
    let results = pipeline.execute().await?;
    println!("pipeline returned {} replies", results.len());

    let script = Script::new("return redis.call('GET', KEYS[1])");
    let value = script
        .invoke(&client, vec!["demo:key".to_string()], vec![])
        .await?;
    println!("script returned {value:?}");

    let info = client.send(&cmd("INFO").arg("server")).await?;
    println!("{}", info.as_string()?.lines().take(3).collect::<Vec<_>>().join("\n"));

    client.quit().await;
    Ok(())
}
