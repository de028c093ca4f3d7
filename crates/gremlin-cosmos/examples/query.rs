//! Run a Gremlin query against a CosmosDB graph.
//!
//! ```text
//! COSMOS_GREMLIN_URL=wss://account.gremlin.cosmos.azure.com:443/ \
//! COSMOS_GREMLIN_USER=/dbs/graphdb/colls/people \
//! COSMOS_GREMLIN_KEY=... \
//! cargo run --example query -- "g.V().limit(5)"
//! ```

use std::time::Duration;

use gremlin_cosmos::{Cosmos, GremlinResult, PoolConfig, RetryConfig};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> GremlinResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let url = std::env::var("COSMOS_GREMLIN_URL")
        .unwrap_or_else(|_| "wss://localhost:8901/".to_string());
    let user = std::env::var("COSMOS_GREMLIN_USER").unwrap_or_default();
    let key = std::env::var("COSMOS_GREMLIN_KEY").unwrap_or_default();
    let query = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "g.V().limit(5)".to_string());

    let cosmos = Cosmos::builder(url)
        .static_credentials(user, key)
        .pool_config(PoolConfig::new(4, Duration::from_secs(60)))
        .retry_config(RetryConfig::new(3))
        .build()?;

    let responses = cosmos.execute(query.as_str()).await?;
    for response in &responses {
        let data: serde_json::Value = response.data_as()?;
        println!("{data}");
        if let Some(charge) = response.request_charge() {
            println!("  request charge: {charge} RU");
        }
    }

    // The same query, streamed envelope by envelope.
    let (sink, mut items) = mpsc::channel(16);
    cosmos.execute_async(query, sink).await?;
    while let Some(item) = items.recv().await {
        match item {
            Ok(response) => println!(
                "partial={} {} bytes",
                response.is_partial(),
                response.data.len()
            ),
            Err(e) => eprintln!("stream failed: {e}"),
        }
    }

    cosmos.stop().await;
    Ok(())
}
