//! The Raft driver task.
//!
//! A single task owns the [`RaftState`] role machine and receives every
//! input (timer fires, peer RPCs, client lock operations) through one
//! mpsc channel, so the engine itself needs no locking and mutation never
//! spans a peer RPC. The driver executes the actions the engine returns:
//! arming timers, sending RPCs on spawned tasks, and applying committed
//! commands to the shared lock table.
//!
//! Client lock operations resolve when their log entry is applied: the
//! driver keeps a map of log index → responder and answers from the
//! outcome the lock table reports.

use crate::error::NodeError;
use crate::peers::PeerClient;
use crate::timers::TimerManager;
use concord_lock::{ApplyOutcome, LockCommand, LockMode, LockTable, WaitForGraph};
use concord_raft::{
    AppendEntriesRequest, AppendEntriesResponse, RaftAction, RaftConfig, RaftState, RaftStatus,
    RequestVoteRequest, RequestVoteResponse, SubmitError,
};
use concord_types::{ClusterTopology, NodeId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace};

/// How long a client lock operation waits for its entry to commit and apply.
const COMMIT_WAIT: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Reply to a client lock operation, derived from the applied outcome.
#[derive(Debug, Clone)]
pub enum LockReply {
    Granted { term: u64 },
    Queued { holders: Vec<NodeId> },
    Released,
}

/// Inputs to the driver task.
#[derive(Debug)]
pub enum RaftEvent {
    ElectionTimeout,
    HeartbeatTick,
    VoteRequest {
        req: RequestVoteRequest,
        reply: oneshot::Sender<RequestVoteResponse>,
    },
    AppendRequest {
        req: AppendEntriesRequest<LockCommand>,
        reply: oneshot::Sender<AppendEntriesResponse>,
    },
    VoteResponse {
        from: NodeId,
        resp: RequestVoteResponse,
    },
    AppendResponse {
        from: NodeId,
        resp: AppendEntriesResponse,
    },
    Acquire {
        name: String,
        mode: LockMode,
        requester: NodeId,
        reply: oneshot::Sender<Result<LockReply, NodeError>>,
    },
    Release {
        name: String,
        requester: NodeId,
        reply: oneshot::Sender<Result<LockReply, NodeError>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RaftTimer {
    Election,
    Heartbeat,
}

/// Cheap handle the transport layer uses to talk to the driver.
#[derive(Clone)]
pub struct RaftHandle {
    tx: mpsc::Sender<RaftEvent>,
    status: Arc<RwLock<RaftStatus>>,
}

impl RaftHandle {
    /// Latest published engine snapshot.
    pub fn status(&self) -> RaftStatus {
        self.status.read().clone()
    }

    pub async fn request_vote(
        &self,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(RaftEvent::VoteRequest { req, reply }).await?;
        rx.await
            .map_err(|_| NodeError::Transient("raft driver stopped".into()))
    }

    pub async fn append_entries(
        &self,
        req: AppendEntriesRequest<LockCommand>,
    ) -> Result<AppendEntriesResponse, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(RaftEvent::AppendRequest { req, reply }).await?;
        rx.await
            .map_err(|_| NodeError::Transient("raft driver stopped".into()))
    }

    pub async fn acquire(
        &self,
        name: String,
        mode: LockMode,
        requester: NodeId,
    ) -> Result<LockReply, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(RaftEvent::Acquire {
            name,
            mode,
            requester,
            reply,
        })
        .await?;
        self.await_reply(rx).await
    }

    pub async fn release(
        &self,
        name: String,
        requester: NodeId,
    ) -> Result<LockReply, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(RaftEvent::Release {
            name,
            requester,
            reply,
        })
        .await?;
        self.await_reply(rx).await
    }

    async fn send(&self, event: RaftEvent) -> Result<(), NodeError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| NodeError::Transient("raft driver stopped".into()))
    }

    async fn await_reply(
        &self,
        rx: oneshot::Receiver<Result<LockReply, NodeError>>,
    ) -> Result<LockReply, NodeError> {
        match tokio::time::timeout(COMMIT_WAIT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NodeError::Transient("raft driver stopped".into())),
            Err(_) => Err(NodeError::Transient(
                "timed out waiting for commit".into(),
            )),
        }
    }
}

/// Spawn the driver task and return its handle.
pub fn spawn(
    config: RaftConfig,
    topology: Arc<ClusterTopology>,
    peers: PeerClient,
    table: Arc<RwLock<LockTable>>,
) -> RaftHandle {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let state = RaftState::new(topology.local().clone(), topology.peer_ids());
    let status = Arc::new(RwLock::new(state.status()));

    let driver = RaftDriver {
        state,
        table,
        status: status.clone(),
        timers: TimerManager::new(tx.clone()),
        config,
        topology,
        peers,
        pending: HashMap::new(),
        event_tx: tx.clone(),
    };
    tokio::spawn(driver.run(rx));

    RaftHandle { tx, status }
}

struct RaftDriver {
    state: RaftState<LockCommand>,
    table: Arc<RwLock<LockTable>>,
    status: Arc<RwLock<RaftStatus>>,
    timers: TimerManager<RaftTimer, RaftEvent>,
    config: RaftConfig,
    topology: Arc<ClusterTopology>,
    peers: PeerClient,
    /// Client responders waiting for their log index to apply.
    pending: HashMap<u64, oneshot::Sender<Result<LockReply, NodeError>>>,
    event_tx: mpsc::Sender<RaftEvent>,
}

impl RaftDriver {
    async fn run(mut self, mut rx: mpsc::Receiver<RaftEvent>) {
        info!(node = %self.topology.local(), "Raft driver started");
        let actions = self.state.start();
        self.execute(actions);
        self.publish_status();

        while let Some(event) = rx.recv().await {
            let actions = self.dispatch(event);
            self.execute(actions);
            self.fail_pending_if_demoted();
            self.publish_status();
        }
        info!(node = %self.topology.local(), "Raft driver stopped");
    }

    fn dispatch(&mut self, event: RaftEvent) -> Vec<RaftAction<LockCommand>> {
        match event {
            RaftEvent::ElectionTimeout => self.state.on_election_timeout(),
            RaftEvent::HeartbeatTick => self.state.on_heartbeat_tick(),
            RaftEvent::VoteRequest { req, reply } => {
                let (resp, actions) = self.state.handle_request_vote(&req);
                let _ = reply.send(resp);
                actions
            }
            RaftEvent::AppendRequest { req, reply } => {
                let (resp, actions) = self.state.handle_append_entries(&req);
                let _ = reply.send(resp);
                actions
            }
            RaftEvent::VoteResponse { from, resp } => self.state.on_vote_response(&from, &resp),
            RaftEvent::AppendResponse { from, resp } => {
                self.state.on_append_response(&from, &resp)
            }
            RaftEvent::Acquire {
                name,
                mode,
                requester,
                reply,
            } => self.handle_acquire(name, mode, requester, reply),
            RaftEvent::Release {
                name,
                requester,
                reply,
            } => self.handle_release(name, requester, reply),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Leader-only client path
    // ═══════════════════════════════════════════════════════════════════════

    fn handle_acquire(
        &mut self,
        name: String,
        mode: LockMode,
        requester: NodeId,
        reply: oneshot::Sender<Result<LockReply, NodeError>>,
    ) -> Vec<RaftAction<LockCommand>> {
        if !self.state.is_leader() {
            let _ = reply.send(Err(NodeError::NoLeader {
                hint: self.state.leader().cloned(),
            }));
            return vec![];
        }

        // An acquire that would wait must not close a cycle in the wait-for
        // graph. Refused before anything reaches the log: the state machine
        // stays untouched.
        {
            let table = self.table.read();
            if !table.would_grant(&name, mode, &requester)
                && WaitForGraph::would_deadlock(&table, &name, &requester)
            {
                debug!(lock = %name, requester = %requester, "Deadlock refused");
                let _ = reply.send(Err(NodeError::Conflict(format!(
                    "acquiring '{name}' would deadlock"
                ))));
                return vec![];
            }
        }

        self.submit(
            LockCommand::Acquire {
                name,
                mode,
                requester,
            },
            reply,
        )
    }

    fn handle_release(
        &mut self,
        name: String,
        requester: NodeId,
        reply: oneshot::Sender<Result<LockReply, NodeError>>,
    ) -> Vec<RaftAction<LockCommand>> {
        if !self.state.is_leader() {
            let _ = reply.send(Err(NodeError::NoLeader {
                hint: self.state.leader().cloned(),
            }));
            return vec![];
        }

        // Rejected against the applied table before any append.
        if !self.table.read().is_holder(&name, &requester) {
            let _ = reply.send(Err(NodeError::NotFound(format!(
                "lock '{name}' is not held by {requester}"
            ))));
            return vec![];
        }

        self.submit(LockCommand::Release { name, requester }, reply)
    }

    fn submit(
        &mut self,
        command: LockCommand,
        reply: oneshot::Sender<Result<LockReply, NodeError>>,
    ) -> Vec<RaftAction<LockCommand>> {
        match self.state.submit(command) {
            Ok((index, actions)) => {
                self.pending.insert(index, reply);
                actions
            }
            Err(SubmitError::NotLeader { leader }) => {
                let _ = reply.send(Err(NodeError::NoLeader { hint: leader }));
                vec![]
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Action execution
    // ═══════════════════════════════════════════════════════════════════════

    fn execute(&mut self, actions: Vec<RaftAction<LockCommand>>) {
        for action in actions {
            match action {
                RaftAction::ResetElectionTimer => {
                    let timeout = self.config.random_election_timeout();
                    self.timers
                        .set_timeout(RaftTimer::Election, timeout, RaftEvent::ElectionTimeout);
                }
                RaftAction::CancelElectionTimer => self.timers.cancel(&RaftTimer::Election),
                RaftAction::StartHeartbeats => self.timers.set_interval(
                    RaftTimer::Heartbeat,
                    self.config.heartbeat_interval,
                    || RaftEvent::HeartbeatTick,
                ),
                RaftAction::StopHeartbeats => self.timers.cancel(&RaftTimer::Heartbeat),
                RaftAction::BroadcastVoteRequest(req) => {
                    for peer in self.topology.peer_ids() {
                        let peers = self.peers.clone();
                        let event_tx = self.event_tx.clone();
                        let req = req.clone();
                        tokio::spawn(async move {
                            match peers.request_vote(&peer, &req).await {
                                Ok(resp) => {
                                    let _ = event_tx
                                        .send(RaftEvent::VoteResponse { from: peer, resp })
                                        .await;
                                }
                                Err(err) => trace!(peer = %peer, %err, "Vote request failed"),
                            }
                        });
                    }
                }
                RaftAction::SendAppend { peer, request } => {
                    let peers = self.peers.clone();
                    let event_tx = self.event_tx.clone();
                    tokio::spawn(async move {
                        match peers.append_entries(&peer, &request).await {
                            Ok(resp) => {
                                let _ = event_tx
                                    .send(RaftEvent::AppendResponse { from: peer, resp })
                                    .await;
                            }
                            Err(err) => trace!(peer = %peer, %err, "Append entries failed"),
                        }
                    });
                }
                RaftAction::Apply { index, command } => self.apply_committed(index, command),
            }
        }
    }

    /// Apply one committed command to the lock table and resolve any client
    /// waiting on that index.
    fn apply_committed(&mut self, index: u64, command: LockCommand) {
        let outcome = match self.table.write().apply(&command) {
            Ok(outcome) => outcome,
            Err(err) => {
                // A committed command the table cannot apply means replicas
                // would diverge. Stop serving; a supervisor may restart us.
                error!(index, %err, "Fatal: committed command violated lock table invariants");
                std::process::exit(70);
            }
        };
        debug!(index, ?outcome, "Applied committed command");

        if let Some(reply) = self.pending.remove(&index) {
            let result = match outcome {
                ApplyOutcome::Granted => Ok(LockReply::Granted {
                    term: self.state.current_term(),
                }),
                ApplyOutcome::Queued => Ok(LockReply::Queued {
                    holders: self.table.read().holders(command.name()),
                }),
                ApplyOutcome::Released { .. } => Ok(LockReply::Released),
                ApplyOutcome::NotHeld => Err(NodeError::NotFound(format!(
                    "lock '{}' is not held by {}",
                    command.name(),
                    command.requester()
                ))),
            };
            let _ = reply.send(result);
        }
    }

    /// A leader that stepped down can no longer learn the fate of entries
    /// it appended; pending clients get a retryable error.
    fn fail_pending_if_demoted(&mut self) {
        if self.state.is_leader() || self.pending.is_empty() {
            return;
        }
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(NodeError::Transient(
                "leadership lost before commit".into(),
            )));
        }
    }

    fn publish_status(&self) {
        *self.status.write() = self.state.status();
    }
}
