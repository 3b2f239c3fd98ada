//! HTTP request handlers.

use super::state::AppState;
use super::types::*;
use crate::error::NodeError;
use crate::raft_driver::LockReply;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use concord_lock::{LockMode, WaitForGraph};
use concord_pbft::{PbftMessage, PbftMessageKind, SubmitError};
use concord_types::{Digest, NodeId};
use tracing::{debug, info};

// ═══════════════════════════════════════════════════════════════════════════
// Health & metrics
// ═══════════════════════════════════════════════════════════════════════════

/// `GET /` - liveness plus a quick view of the Raft role.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let raft = state.raft.status();
    Json(HealthResponse {
        status: "online",
        node_id: state.topology.local().clone(),
        raft_state: raft.role,
        leader: raft.leader,
        term: raft.term,
        peer_count: state.topology.len() - 1,
    })
}

/// `GET /metrics` - JSON metrics for the node.
pub async fn metrics(State(state): State<AppState>) -> Json<MetricsResponse> {
    let raft = state.raft.status();
    let pbft = state.pbft.status();
    Json(MetricsResponse {
        node_id: state.topology.local().clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        cache: state.cache.stats(),
        raft: RaftMetrics {
            role: raft.role,
            term: raft.term,
            commit_index: raft.commit_index,
            last_applied: raft.last_applied,
        },
        pbft: PbftMetrics {
            view: pbft.view,
            last_executed: pbft.last_executed,
            executed_count: pbft.executed_count,
        },
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Lock manager
// ═══════════════════════════════════════════════════════════════════════════

/// `POST /lock/{name}?lock_type={shared|exclusive}` - acquire.
pub async fn acquire_lock(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<LockParams>,
) -> Result<Response, NodeError> {
    let mode = match params.lock_type.as_deref() {
        None => LockMode::Exclusive,
        Some(raw) => LockMode::parse(raw).ok_or_else(|| {
            NodeError::BadRequest(format!("lock_type must be 'shared' or 'exclusive', got '{raw}'"))
        })?,
    };
    let requester = params
        .requester
        .map(NodeId::new)
        .unwrap_or_else(|| state.topology.local().clone());

    match state
        .raft
        .acquire(name.clone(), mode, requester.clone())
        .await
    {
        Ok(LockReply::Granted { term }) => {
            info!(lock = %name, %requester, "Lock acquired");
            Ok(Json(LockOpResponse {
                status: "granted",
                lock: name,
                requester,
                term: Some(term),
            })
            .into_response())
        }
        Ok(LockReply::Queued { holders }) => Ok((
            StatusCode::LOCKED,
            Json(LockQueuedResponse {
                status: "queued",
                lock: name,
                requester,
                holders,
            }),
        )
            .into_response()),
        Ok(LockReply::Released) => Err(NodeError::Transient(
            "unexpected reply to acquire".into(),
        )),
        Err(NodeError::NoLeader { hint: Some(leader) }) => {
            let path = format!(
                "/lock/{name}?lock_type={}&requester={requester}",
                mode.query_value()
            );
            let (status, body) = state
                .peers
                .forward(&leader, reqwest::Method::POST, &path, None)
                .await?;
            Ok((status, Json(body)).into_response())
        }
        Err(err) => Err(err),
    }
}

/// `DELETE /lock/{name}` - release.
pub async fn release_lock(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<LockParams>,
) -> Result<Response, NodeError> {
    let requester = params
        .requester
        .map(NodeId::new)
        .unwrap_or_else(|| state.topology.local().clone());

    match state.raft.release(name.clone(), requester.clone()).await {
        Ok(LockReply::Released) => {
            info!(lock = %name, %requester, "Lock released");
            Ok(Json(LockOpResponse {
                status: "released",
                lock: name,
                requester,
                term: None,
            })
            .into_response())
        }
        Ok(_) => Err(NodeError::Transient("unexpected reply to release".into())),
        Err(NodeError::NoLeader { hint: Some(leader) }) => {
            let path = format!("/lock/{name}?requester={requester}");
            let (status, body) = state
                .peers
                .forward(&leader, reqwest::Method::DELETE, &path, None)
                .await?;
            Ok((status, Json(body)).into_response())
        }
        Err(err) => Err(err),
    }
}

/// `GET /lock/{name}` - local, best-effort status of one lock.
pub async fn lock_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, NodeError> {
    let view = state
        .table
        .read()
        .status(&name)
        .ok_or_else(|| NodeError::NotFound(format!("lock '{name}'")))?;
    Ok(Json(view).into_response())
}

/// `GET /locks` - every lock plus the derived wait-for graph.
pub async fn list_locks(State(state): State<AppState>) -> Json<LocksResponse> {
    let raft = state.raft.status();
    let table = state.table.read();
    let graph = WaitForGraph::from_table(&table);
    Json(LocksResponse {
        node_id: state.topology.local().clone(),
        is_leader: raft.role == concord_raft::RaftRole::Leader,
        leader: raft.leader,
        locks: table.list(),
        wait_for_graph: graph.snapshot(),
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Queue
// ═══════════════════════════════════════════════════════════════════════════

/// `POST /queue/{name}` - produce a message.
pub async fn produce(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(message): Json<serde_json::Value>,
) -> Result<Response, NodeError> {
    let responsible = state.topology.responsible(&name).clone();
    if !state.topology.is_local(&responsible) {
        debug!(queue = %name, target = %responsible, "Forwarding produce");
        let (status, body) = state
            .peers
            .forward(
                &responsible,
                reqwest::Method::POST,
                &format!("/queue/{name}"),
                Some(&message),
            )
            .await?;
        return Ok((status, Json(body)).into_response());
    }

    state.queue.produce(&name, &message).await?;
    Ok(Json(ProduceResponse {
        status: "produced",
        queue: name,
        node: state.topology.local().clone(),
    })
    .into_response())
}

/// `GET /queue/{name}` - consume the head message, at-least-once.
pub async fn consume(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, NodeError> {
    let responsible = state.topology.responsible(&name).clone();
    if !state.topology.is_local(&responsible) {
        debug!(queue = %name, target = %responsible, "Forwarding consume");
        let (status, body) = state
            .peers
            .forward(
                &responsible,
                reqwest::Method::GET,
                &format!("/queue/{name}"),
                None,
            )
            .await?;
        return Ok((status, Json(body)).into_response());
    }

    match state.queue.consume(&name).await? {
        Some(consumed) => Ok(Json(ConsumeResponse {
            status: "consumed",
            node: state.topology.local().clone(),
            message: consumed.message,
            processing_key: consumed.processing_key,
            raw: consumed.raw,
        })
        .into_response()),
        None => Err(NodeError::NotFound(format!("queue '{name}' is empty"))),
    }
}

/// `POST /queue/ack/{processing_key}` - remove an in-flight message.
pub async fn ack(
    State(state): State<AppState>,
    Path(processing_key): Path<String>,
    Json(message): Json<serde_json::Value>,
) -> Result<Response, NodeError> {
    let queue = concord_data::QueuePartition::queue_of_processing_key(&processing_key)
        .ok_or_else(|| {
            NodeError::BadRequest(format!("'{processing_key}' is not a processing key"))
        })?
        .to_string();

    let responsible = state.topology.responsible(&queue).clone();
    if !state.topology.is_local(&responsible) {
        debug!(queue = %queue, target = %responsible, "Forwarding ack");
        let (status, body) = state
            .peers
            .forward(
                &responsible,
                reqwest::Method::POST,
                &format!("/queue/ack/{processing_key}"),
                Some(&message),
            )
            .await?;
        return Ok((status, Json(body)).into_response());
    }

    // Acking a message that was never consumed or was already acked removes
    // nothing; that is a normal outcome, not an error.
    let removed = state.queue.ack(&processing_key, &message).await?;
    Ok(Json(AckResponse {
        status: if removed { "acknowledged" } else { "not_found" },
        removed,
    })
    .into_response())
}

// ═══════════════════════════════════════════════════════════════════════════
// Coherent cache
// ═══════════════════════════════════════════════════════════════════════════

/// `GET /cache/{key}` - read through the cache.
pub async fn cache_get(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, NodeError> {
    if let Some((data, cache_state)) = state.cache.lookup(&key) {
        return Ok(Json(CacheGetResponse {
            key,
            data,
            source: "cache",
            cache_state,
        })
        .into_response());
    }

    let Some(data) = state.source.fetch(&key).await? else {
        return Err(NodeError::NotFound(format!("key '{key}'")));
    };
    state.cache.insert_shared(&key, data.clone());
    Ok(Json(CacheGetResponse {
        key,
        data,
        source: "origin",
        cache_state: concord_data::CacheState::Shared,
    })
    .into_response())
}

/// `POST /cache/{key}` - local write, then fire-and-forget invalidation of
/// every peer copy.
pub async fn cache_put(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<CachePutBody>,
) -> Result<Json<CachePutResponse>, NodeError> {
    state.cache.put_modified(&key, body.data.clone());

    // Write through to the backing source before telling peers to drop
    // their copies, so a re-fetch after invalidation sees the new value.
    let stored = state.source.write(&key, &body.data).await?;
    if !stored {
        debug!(key = %key, "Backing source is read-only; skipped write-through");
    }

    let peers = state.peers.clone();
    let broadcast_key = key.clone();
    tokio::spawn(async move {
        peers.broadcast_invalidate(&broadcast_key).await;
    });

    Ok(Json(CachePutResponse {
        status: "updated",
        key,
        cache_state: concord_data::CacheState::Modified,
    }))
}

/// `POST /cache/invalidate/{key}` - peer-only: drop the local copy.
pub async fn cache_invalidate(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Json<InvalidateResponse> {
    let existed = state.cache.invalidate(&key);
    Json(InvalidateResponse {
        status: "invalidated",
        key,
        existed,
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// PBFT
// ═══════════════════════════════════════════════════════════════════════════

/// `POST /pbft/request` - client entry point; replicas forward to the
/// primary.
pub async fn pbft_request(
    State(state): State<AppState>,
    Json(request): Json<serde_json::Value>,
) -> Result<Response, NodeError> {
    match state.pbft.submit(request.clone()).await? {
        Ok(receipt) => Ok(Json(receipt).into_response()),
        Err(SubmitError::NotPrimary { primary, .. }) => {
            debug!(primary = %primary, "Forwarding PBFT request to primary");
            let (status, body) = state
                .peers
                .forward(
                    &primary,
                    reqwest::Method::POST,
                    "/pbft/request",
                    Some(&request),
                )
                .await?;
            Ok((status, Json(body)).into_response())
        }
    }
}

/// `POST /pbft/message` - peer protocol traffic.
pub async fn pbft_message(
    State(state): State<AppState>,
    Json(msg): Json<PbftMessage>,
) -> Result<Json<PbftMessageAck>, NodeError> {
    state.pbft.deliver(msg).await?;
    Ok(Json(PbftMessageAck {
        status: "processed",
    }))
}

/// `GET /pbft/status`.
pub async fn pbft_status(State(state): State<AppState>) -> Response {
    Json(state.pbft.status()).into_response()
}

/// `POST /pbft/simulate-byzantine?behavior=...` - emit one faulty protocol
/// message so peers' suspicion tracking can be observed. Demo/testing only.
pub async fn pbft_simulate_byzantine(
    State(state): State<AppState>,
    Query(params): Query<SimulateByzantineParams>,
) -> Result<Json<SimulateByzantineResponse>, NodeError> {
    let behavior = params
        .behavior
        .unwrap_or_else(|| "conflicting_prepare".to_string());
    let status = state.pbft.status();
    let sequence = status.sequence.max(1);
    let local = state.topology.local().clone();

    let msg = match behavior.as_str() {
        "conflicting_prepare" => PbftMessage::tagged(
            PbftMessageKind::Prepare,
            status.view,
            sequence,
            Digest::of_bytes(b"forged-digest"),
            local,
            &state.cluster_secret,
            None,
        ),
        "invalid_tag" => {
            let mut msg = PbftMessage::tagged(
                PbftMessageKind::Prepare,
                status.view,
                sequence,
                Digest::of_bytes(b"forged-digest"),
                local,
                &state.cluster_secret,
                None,
            );
            msg.tag = Digest::ZERO;
            msg
        }
        other => {
            return Err(NodeError::BadRequest(format!(
                "unknown behavior '{other}'; expected conflicting_prepare or invalid_tag"
            )))
        }
    };

    let peers = state.peers.clone();
    tokio::spawn(async move {
        peers.broadcast_pbft(&msg).await;
    });

    Ok(Json(SimulateByzantineResponse {
        status: "byzantine_behavior_simulated",
        behavior,
    }))
}

// ═══════════════════════════════════════════════════════════════════════════
// Raft peer RPCs
// ═══════════════════════════════════════════════════════════════════════════

/// `POST /raft/request-vote`.
pub async fn raft_request_vote(
    State(state): State<AppState>,
    Json(req): Json<concord_raft::RequestVoteRequest>,
) -> Result<Json<concord_raft::RequestVoteResponse>, NodeError> {
    Ok(Json(state.raft.request_vote(req).await?))
}

/// `POST /raft/append-entries`.
pub async fn raft_append_entries(
    State(state): State<AppState>,
    Json(req): Json<concord_raft::AppendEntriesRequest<concord_lock::LockCommand>>,
) -> Result<Json<concord_raft::AppendEntriesResponse>, NodeError> {
    Ok(Json(state.raft.append_entries(req).await?))
}
