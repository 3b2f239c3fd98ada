//! Raft peer RPC messages.
//!
//! Wire format is JSON over the node's peer HTTP surface. Repeated delivery
//! is safe: every request carries the sender's term and is checked against
//! the receiver's `current_term` and log state.

use concord_types::NodeId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// One entry in the replicated log. Index 1 is the first entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(serialize = "C: Serialize", deserialize = "C: DeserializeOwned"))]
pub struct LogEntry<C> {
    pub term: u64,
    pub index: u64,
    pub command: C,
}

/// Candidate → peer vote solicitation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// Peer → candidate vote reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// Leader → follower replication (an empty `entries` is a heartbeat).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(serialize = "C: Serialize", deserialize = "C: DeserializeOwned"))]
pub struct AppendEntriesRequest<C> {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry<C>>,
    pub leader_commit: u64,
}

/// Follower → leader replication reply.
///
/// `match_index` is meaningful only when `success` is true: the highest log
/// index the follower now knows it shares with the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    pub match_index: u64,
}
