//! Request and response types for the HTTP surface.

use concord_data::{CacheState, CacheStats};
use concord_lock::LockRecordView;
use concord_raft::RaftRole;
use concord_types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ═══════════════════════════════════════════════════════════════════════════
// Health & metrics
// ═══════════════════════════════════════════════════════════════════════════

/// Response for `GET /`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub node_id: NodeId,
    pub raft_state: RaftRole,
    pub leader: Option<NodeId>,
    pub term: u64,
    pub peer_count: usize,
}

/// Response for `GET /metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsResponse {
    pub node_id: NodeId,
    pub uptime_secs: u64,
    pub cache: CacheStats,
    pub raft: RaftMetrics,
    pub pbft: PbftMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct RaftMetrics {
    pub role: RaftRole,
    pub term: u64,
    pub commit_index: u64,
    pub last_applied: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PbftMetrics {
    pub view: u64,
    pub last_executed: u64,
    pub executed_count: u64,
}

// ═══════════════════════════════════════════════════════════════════════════
// Locks
// ═══════════════════════════════════════════════════════════════════════════

/// Query parameters for lock operations.
#[derive(Debug, Clone, Deserialize)]
pub struct LockParams {
    pub lock_type: Option<String>,
    /// Originating requester; set by a forwarding node so the leader
    /// records who actually asked.
    pub requester: Option<String>,
}

/// Response for a granted acquire or completed release.
#[derive(Debug, Clone, Serialize)]
pub struct LockOpResponse {
    pub status: &'static str,
    pub lock: String,
    pub requester: NodeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub term: Option<u64>,
}

/// 423 body for a queued acquire.
#[derive(Debug, Clone, Serialize)]
pub struct LockQueuedResponse {
    pub status: &'static str,
    pub lock: String,
    pub requester: NodeId,
    pub holders: Vec<NodeId>,
}

/// Response for `GET /locks`.
#[derive(Debug, Clone, Serialize)]
pub struct LocksResponse {
    pub node_id: NodeId,
    pub is_leader: bool,
    pub leader: Option<NodeId>,
    pub locks: BTreeMap<String, LockRecordView>,
    pub wait_for_graph: BTreeMap<NodeId, Vec<NodeId>>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Queue
// ═══════════════════════════════════════════════════════════════════════════

/// Response for `POST /queue/{name}`.
#[derive(Debug, Clone, Serialize)]
pub struct ProduceResponse {
    pub status: &'static str,
    pub queue: String,
    pub node: NodeId,
}

/// Response for `GET /queue/{name}` with a message available.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumeResponse {
    pub status: &'static str,
    pub node: NodeId,
    pub message: serde_json::Value,
    /// Everything needed to ack without recomputing routing.
    pub processing_key: String,
    pub raw: String,
}

/// Response for `POST /queue/ack/{processing_key}`.
#[derive(Debug, Clone, Serialize)]
pub struct AckResponse {
    pub status: &'static str,
    pub removed: bool,
}

// ═══════════════════════════════════════════════════════════════════════════
// Cache
// ═══════════════════════════════════════════════════════════════════════════

/// Body for `POST /cache/{key}`.
#[derive(Debug, Clone, Deserialize)]
pub struct CachePutBody {
    pub data: serde_json::Value,
}

/// Response for `GET /cache/{key}`.
#[derive(Debug, Clone, Serialize)]
pub struct CacheGetResponse {
    pub key: String,
    pub data: serde_json::Value,
    /// Where the value came from: "cache" or "origin".
    pub source: &'static str,
    pub cache_state: CacheState,
}

/// Response for `POST /cache/{key}`.
#[derive(Debug, Clone, Serialize)]
pub struct CachePutResponse {
    pub status: &'static str,
    pub key: String,
    pub cache_state: CacheState,
}

/// Response for the peer-only `POST /cache/invalidate/{key}`.
#[derive(Debug, Clone, Serialize)]
pub struct InvalidateResponse {
    pub status: &'static str,
    pub key: String,
    pub existed: bool,
}

// ═══════════════════════════════════════════════════════════════════════════
// PBFT
// ═══════════════════════════════════════════════════════════════════════════

/// Query parameters for `POST /pbft/simulate-byzantine`.
#[derive(Debug, Clone, Deserialize)]
pub struct SimulateByzantineParams {
    pub behavior: Option<String>,
}

/// Response for `POST /pbft/simulate-byzantine`.
#[derive(Debug, Clone, Serialize)]
pub struct SimulateByzantineResponse {
    pub status: &'static str,
    pub behavior: String,
}

/// Response for `POST /pbft/message`.
#[derive(Debug, Clone, Serialize)]
pub struct PbftMessageAck {
    pub status: &'static str,
}
