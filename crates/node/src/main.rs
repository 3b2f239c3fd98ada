//! Node binary.

use clap::Parser;
use concord_data::{DataSource, ListStore, MemoryListStore, RedisListStore, StaticDataSource};
use concord_node::config::{Cli, NodeConfig};
use concord_node::{build_node, telemetry};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    telemetry::init_telemetry();
    let config = NodeConfig::from_cli(cli)?;

    let store: Arc<dyn ListStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisListStore::connect(url).await?),
        None => {
            warn!("no --redis-url configured; queues use an in-process store (single-node only)");
            Arc::new(MemoryListStore::new())
        }
    };
    let source: Arc<dyn DataSource> =
        Arc::new(StaticDataSource::with_entries(config.seed_data.clone()));

    let router = build_node(&config, store, source)?;
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(
        node = %config.topology.local(),
        addr = %config.bind_addr,
        cluster_size = config.topology.len(),
        "concord node listening"
    );
    axum::serve(listener, router).await?;
    Ok(())
}
