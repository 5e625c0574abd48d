use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use xorshard::{AddRequest, ClusterConfig, LocalCluster, SpaceId};

const DEFAULT_CONFIG: &str = r#"{
    "anchor": "/xorshard/demo",
    "shards": [
        { "pivot": "0x0000000000000000", "host": "127.0.0.1", "port": 7000 },
        { "pivot": "0x8000000000000000", "host": "127.0.0.1", "port": 7001 },
        { "host": "127.0.0.1", "port": 7002 },
        { "host": "127.0.0.1", "port": 7003 }
    ]
}"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // cargo run --example local-cluster [config.json]
    let config = match std::env::args().nth(1) {
        Some(path) => ClusterConfig::from_file(path)?,
        None => ClusterConfig::from_json(DEFAULT_CONFIG)?,
    };
    let cluster = LocalCluster::boot(config).await?;
    for worker in cluster.workers() {
        info!(worker = %worker.id, shard = %worker.shard.key, "worker");
    }

    let client = Arc::new(cluster.client().await?);
    let _watch = client.watch()?;

    let hosts = ["web-1", "web-2", "db-1"];
    let batch: Vec<AddRequest> = hosts
        .iter()
        .enumerate()
        .map(|(i, host)| AddRequest {
            space: SpaceId::hash("requests", vec![("host", *host)]),
            secondary: 0,
            delta: (i + 1) as f64,
        })
        .collect();
    for round in 0..3 {
        let sums = client.add_batch(&batch).await;
        info!(round, ?sums, "batch added");
    }

    let cpu = SpaceId::hash("cpu", vec![("host", "web-1")]);
    for t in 0..10 {
        client.put(cpu, 1_700_000_000 + t, 0.1 * t as f64).await?;
    }
    let points = client.query(cpu, 1_700_000_003, 1_700_000_006, 100).await?;
    info!(owner = %client.locate(cpu)?.key, ?points, "cpu window");

    let spaces: Vec<SpaceId> = batch.iter().map(|a| a.space).collect();
    let sums = client.sum_batch(&spaces).await;
    info!(?sums, "sums");

    cluster.shutdown().await?;
    Ok(())
}
