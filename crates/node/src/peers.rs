//! HTTP peer client.
//!
//! All peer-to-peer traffic (Raft RPCs, PBFT protocol messages, cache
//! invalidations, and forwarded client operations) goes through one
//! reqwest client with a per-call deadline. Failures are returned to the
//! caller and absorbed there: consensus drivers retry on their own cadence,
//! broadcasts are fire-and-forget.

use crate::error::NodeError;
use axum::http::StatusCode;
use concord_lock::LockCommand;
use concord_pbft::PbftMessage;
use concord_raft::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
};
use concord_types::{ClusterTopology, NodeId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{trace, warn};

/// Errors talking to one peer. All transient.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer '{peer}' has no known address")]
    UnknownPeer { peer: NodeId },

    #[error("peer request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("peer returned {0}")]
    BadStatus(StatusCode),
}

impl From<PeerError> for NodeError {
    fn from(err: PeerError) -> Self {
        NodeError::Transient(err.to_string())
    }
}

/// Client for every outbound peer call.
#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
    topology: Arc<ClusterTopology>,
}

impl PeerClient {
    pub fn new(topology: Arc<ClusterTopology>, rpc_timeout: Duration) -> Result<Self, NodeError> {
        let http = reqwest::Client::builder()
            .timeout(rpc_timeout)
            .build()
            .map_err(|e| NodeError::Transient(format!("building http client: {e}")))?;
        Ok(Self { http, topology })
    }

    fn addr_of(&self, peer: &NodeId) -> Result<String, PeerError> {
        self.topology
            .addr_of(peer)
            .map(str::to_string)
            .ok_or_else(|| PeerError::UnknownPeer { peer: peer.clone() })
    }

    async fn post_json<B: Serialize, R: DeserializeOwned>(
        &self,
        peer: &NodeId,
        path: &str,
        body: &B,
    ) -> Result<R, PeerError> {
        let addr = self.addr_of(peer)?;
        let response = self
            .http
            .post(format!("{addr}{path}"))
            .json(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PeerError::BadStatus(response.status()));
        }
        Ok(response.json().await?)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Raft RPCs
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn request_vote(
        &self,
        peer: &NodeId,
        req: &RequestVoteRequest,
    ) -> Result<RequestVoteResponse, PeerError> {
        self.post_json(peer, "/raft/request-vote", req).await
    }

    pub async fn append_entries(
        &self,
        peer: &NodeId,
        req: &AppendEntriesRequest<LockCommand>,
    ) -> Result<AppendEntriesResponse, PeerError> {
        self.post_json(peer, "/raft/append-entries", req).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Fire-and-forget broadcasts
    // ═══════════════════════════════════════════════════════════════════════

    /// Send a PBFT protocol message to every peer. Errors are logged and
    /// dropped; quorum formation tolerates missing deliveries.
    pub async fn broadcast_pbft(&self, msg: &PbftMessage) {
        for peer in self.topology.peer_ids() {
            let result: Result<serde_json::Value, PeerError> =
                self.post_json(&peer, "/pbft/message", msg).await;
            if let Err(err) = result {
                trace!(peer = %peer, %err, "PBFT broadcast delivery failed");
            }
        }
    }

    /// Tell every peer to drop its copy of a cache key.
    pub async fn broadcast_invalidate(&self, key: &str) {
        let body = serde_json::json!({});
        for peer in self.topology.peer_ids() {
            let Ok(addr) = self.addr_of(&peer) else {
                continue;
            };
            let result = self
                .http
                .post(format!("{addr}/cache/invalidate/{key}"))
                .json(&body)
                .send()
                .await;
            if let Err(err) = result {
                trace!(peer = %peer, %err, "Invalidate delivery failed");
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Client-operation forwarding
    // ═══════════════════════════════════════════════════════════════════════

    /// Forward a client operation to the node that should serve it and pass
    /// its reply (status and JSON body) back through.
    pub async fn forward(
        &self,
        target: &NodeId,
        method: reqwest::Method,
        path_and_query: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<(StatusCode, serde_json::Value), NodeError> {
        let addr = self
            .addr_of(target)
            .map_err(|e| NodeError::Transient(e.to_string()))?;
        trace!(target = %target, path = path_and_query, "Forwarding client operation");

        let mut request = self.http.request(method, format!("{addr}{path_and_query}"));
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|e| {
            warn!(target = %target, %e, "Forwarding failed");
            NodeError::Transient(format!("forwarding to {target}: {e}"))
        })?;

        let status =
            StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let value = response
            .json::<serde_json::Value>()
            .await
            .unwrap_or(serde_json::Value::Null);
        Ok((status, value))
    }
}
