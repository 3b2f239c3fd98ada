//! Node configuration.

use clap::Parser;
use concord_raft::RaftConfig;
use concord_types::{ClusterTopology, NodeId, NodeSpec, TopologyError};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::Duration;
use thiserror::Error;

/// Command line / environment configuration for one node.
#[derive(Debug, Clone, Parser)]
#[command(name = "concord-node", about = "Distributed coordination service node")]
pub struct Cli {
    /// Stable identifier of this node.
    #[arg(long, env = "NODE_ID")]
    pub node_id: String,

    /// Address to bind the HTTP surface to.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8000")]
    pub bind_addr: SocketAddr,

    /// Every cluster member, in a shared order, as `id=http://host:port`
    /// entries separated by commas.
    #[arg(long, env = "ALL_NODES", value_delimiter = ',')]
    pub all_nodes: Vec<String>,

    /// Redis endpoint backing the durable list store. Without it the node
    /// falls back to an in-process store, useful only for single-node runs.
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Maximum number of cache entries before LRU eviction.
    #[arg(long, env = "CACHE_MAXSIZE", default_value_t = 128)]
    pub cache_maxsize: usize,

    /// Shared secret for PBFT message tags.
    #[arg(long, env = "CLUSTER_SECRET", default_value = "concord-dev-secret")]
    pub cluster_secret: String,

    /// Seed entries for the cache's backing data source, as a JSON object.
    #[arg(long, env = "SEED_DATA")]
    pub seed_data: Option<String>,

    /// Leader heartbeat period in milliseconds.
    #[arg(long, env = "HEARTBEAT_MS", default_value_t = 50)]
    pub heartbeat_ms: u64,

    /// Election timeout lower bound in milliseconds.
    #[arg(long, env = "ELECTION_MIN_MS", default_value_t = 250)]
    pub election_min_ms: u64,

    /// Election timeout upper bound in milliseconds.
    #[arg(long, env = "ELECTION_MAX_MS", default_value_t = 500)]
    pub election_max_ms: u64,

    /// Per-attempt peer RPC deadline in milliseconds.
    #[arg(long, env = "RPC_TIMEOUT_MS", default_value_t = 1000)]
    pub rpc_timeout_ms: u64,

    /// PBFT primary-timeout check period in milliseconds.
    #[arg(long, env = "PBFT_PRIMARY_TIMEOUT_MS", default_value_t = 5000)]
    pub pbft_primary_timeout_ms: u64,
}

/// Errors turning CLI input into a runnable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Raft(#[from] concord_raft::RaftConfigError),

    #[error("cache maxsize must be at least 1")]
    ZeroCacheSize,

    #[error("seed data is not a JSON object: {0}")]
    BadSeedData(String),
}

/// Validated node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub topology: ClusterTopology,
    pub bind_addr: SocketAddr,
    pub redis_url: Option<String>,
    pub cache_maxsize: NonZeroUsize,
    pub cluster_secret: String,
    pub seed_data: Vec<(String, serde_json::Value)>,
    pub raft: RaftConfig,
    pub rpc_timeout: Duration,
    pub pbft_primary_timeout: Duration,
}

impl NodeConfig {
    /// Validate CLI input and build the runtime configuration.
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let nodes = cli
            .all_nodes
            .iter()
            .map(|s| NodeSpec::parse(s))
            .collect::<Result<Vec<_>, _>>()?;
        let topology = ClusterTopology::new(NodeId::new(cli.node_id), nodes)?;

        let raft = RaftConfig {
            heartbeat_interval: Duration::from_millis(cli.heartbeat_ms),
            election_timeout_min: Duration::from_millis(cli.election_min_ms),
            election_timeout_max: Duration::from_millis(cli.election_max_ms),
            rpc_timeout: Duration::from_millis(cli.rpc_timeout_ms),
        };
        raft.validate()?;

        let cache_maxsize =
            NonZeroUsize::new(cli.cache_maxsize).ok_or(ConfigError::ZeroCacheSize)?;

        let seed_data = match &cli.seed_data {
            None => Vec::new(),
            Some(raw) => {
                let value: serde_json::Value = serde_json::from_str(raw)
                    .map_err(|e| ConfigError::BadSeedData(e.to_string()))?;
                match value {
                    serde_json::Value::Object(map) => map.into_iter().collect(),
                    other => return Err(ConfigError::BadSeedData(other.to_string())),
                }
            }
        };

        Ok(Self {
            topology,
            bind_addr: cli.bind_addr,
            redis_url: cli.redis_url,
            cache_maxsize,
            cluster_secret: cli.cluster_secret,
            seed_data,
            raft,
            rpc_timeout: Duration::from_millis(cli.rpc_timeout_ms),
            pbft_primary_timeout: Duration::from_millis(cli.pbft_primary_timeout_ms),
        })
    }
}
