//! The concord coordination service node.
//!
//! A node offers three coordination primitives over one HTTP surface: a
//! Raft-replicated lock manager with deadlock refusal, a consistent-hash
//! partitioned durable message queue, and a coherent per-node cache with
//! cross-node invalidation. A PBFT engine totally orders opaque requests on
//! the side.
//!
//! # Architecture
//!
//! The consensus engines are synchronous state machines (see `concord-raft`
//! and `concord-pbft`); this crate wraps them in driver tasks that own all
//! I/O:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        concord node                         │
//! │                                                             │
//! │  axum handlers ── events ──► Raft driver ──► lock table     │
//! │        │                        │   ▲                       │
//! │        │                     timers  └─ peer RPCs (reqwest) │
//! │        ├── events ──► PBFT driver ──► broadcasts            │
//! │        ├── hash ring ──► queue partition ──► list store     │
//! │        └── coherent cache ──► invalidation broadcasts       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Components are constructed in dependency order (hash ring inside the
//! topology, then Raft, lock manager, PBFT, cache/queue) by [`build_node`].

pub mod config;
pub mod error;
pub mod peers;
pub mod pbft_driver;
pub mod raft_driver;
pub mod rpc;
pub mod telemetry;
mod timers;

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::peers::PeerClient;
use crate::rpc::AppState;
use axum::Router;
use concord_data::{CoherentCache, DataSource, ListStore, QueuePartition};
use concord_lock::LockTable;
use concord_pbft::PbftState;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;

/// Construct every component in dependency order, spawn the driver tasks,
/// and return the HTTP router. The caller supplies the external
/// collaborators: the durable list store and the cache's backing source.
pub fn build_node(
    config: &NodeConfig,
    store: Arc<dyn ListStore>,
    source: Arc<dyn DataSource>,
) -> Result<Router, NodeError> {
    let topology = Arc::new(config.topology.clone());
    let peers = PeerClient::new(topology.clone(), config.rpc_timeout)?;

    // Raft and the lock table it applies into.
    let table = Arc::new(RwLock::new(LockTable::new()));
    let raft = raft_driver::spawn(
        config.raft.clone(),
        topology.clone(),
        peers.clone(),
        table.clone(),
    );

    // PBFT.
    let pbft_state = PbftState::new(config.topology.clone(), config.cluster_secret.clone());
    let pbft = pbft_driver::spawn(pbft_state, peers.clone(), config.pbft_primary_timeout);

    // Queue partition and coherent cache.
    let queue = QueuePartition::new(store);
    let cache = Arc::new(CoherentCache::new(config.cache_maxsize));

    let state = AppState {
        topology,
        cluster_secret: config.cluster_secret.clone(),
        raft,
        table,
        pbft,
        cache,
        queue,
        source,
        peers,
        start_time: Instant::now(),
    };
    Ok(rpc::create_router(state))
}
