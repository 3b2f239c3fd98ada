//! Shared state for the HTTP handlers.

use crate::peers::PeerClient;
use crate::pbft_driver::PbftHandle;
use crate::raft_driver::RaftHandle;
use concord_data::{CoherentCache, DataSource, QueuePartition};
use concord_lock::LockTable;
use concord_types::ClusterTopology;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;

/// Everything a handler can reach. Cloning is cheap; all heavy members are
/// behind `Arc`s or are channel handles.
#[derive(Clone)]
pub struct AppState {
    pub topology: Arc<ClusterTopology>,
    pub cluster_secret: String,
    pub raft: RaftHandle,
    /// Applied lock table; written only by the Raft driver, read here for
    /// local best-effort status queries.
    pub table: Arc<RwLock<LockTable>>,
    pub pbft: PbftHandle,
    pub cache: Arc<CoherentCache>,
    pub queue: QueuePartition,
    pub source: Arc<dyn DataSource>,
    pub peers: PeerClient,
    pub start_time: Instant,
}
