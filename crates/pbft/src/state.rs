//! The PBFT engine state machine.

use crate::message::{PbftMessage, PbftMessageKind};
use concord_types::{ClusterTopology, Digest, NodeId};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Protocol violations at or above this count flag a peer Byzantine.
pub const SUSPICION_THRESHOLD: u32 = 3;

/// Actions the engine wants the driver to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum PbftAction {
    /// Send a protocol message to every peer (fire-and-forget).
    Broadcast(PbftMessage),

    /// A request reached committed-local and was applied, in sequence order.
    Executed {
        sequence: u64,
        request: serde_json::Value,
    },
}

/// Error from submitting a client request on a non-primary.
#[derive(Debug, Clone, Error)]
pub enum SubmitError {
    #[error("not the primary for view {view} (primary: {primary})")]
    NotPrimary { view: u64, primary: NodeId },
}

/// Acknowledgement returned to the client that submitted a request.
#[derive(Debug, Clone, Serialize)]
pub struct PbftReceipt {
    pub status: &'static str,
    pub sequence: u64,
    pub digest: Digest,
}

/// Point-in-time snapshot for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PbftStatus {
    pub view: u64,
    pub sequence: u64,
    pub primary: NodeId,
    pub is_primary: bool,
    pub f: usize,
    pub quorum: usize,
    pub last_executed: u64,
    pub executed_count: u64,
    pub byzantine_nodes: Vec<NodeId>,
    pub suspicions: HashMap<NodeId, u32>,
    pub primary_suspected: bool,
}

/// Per-sequence protocol buffers.
///
/// Prepares and commits are stored even when they arrive ahead of the
/// pre-prepare (HTTP delivery is unordered); quorum counting only considers
/// records whose digest agrees with the accepted pre-prepare.
#[derive(Debug, Default)]
struct SequenceState {
    pre_prepare: Option<PbftMessage>,
    prepares: HashMap<NodeId, PbftMessage>,
    commits: HashMap<NodeId, PbftMessage>,
    /// We reached the prepare quorum and broadcast our commit.
    prepared: bool,
    /// We reached the commit quorum (committed-local).
    committed: bool,
    executed: bool,
}

/// PBFT engine for one node.
///
/// # State Machine Flow
///
/// 1. **Client request** → primary assigns the next sequence, broadcasts
///    PRE_PREPARE (and processes its own copy)
/// 2. **PRE_PREPARE accepted** → replica stores it and broadcasts PREPARE
/// 3. **Prepare quorum** (`2f+1` matching, own included) → broadcast COMMIT
/// 4. **Commit quorum** → committed-local; execute in strict sequence order
///
/// Every violation of the acceptance rules increments the sender's suspicion
/// counter; a sender at [`SUSPICION_THRESHOLD`] is Byzantine and its
/// subsequent messages are dropped on arrival.
pub struct PbftState {
    topology: ClusterTopology,
    secret: String,

    view: u64,
    /// Last sequence assigned by this node as primary.
    sequence: u64,
    quorum: usize,

    sequences: BTreeMap<u64, SequenceState>,
    last_executed: u64,
    executed_count: u64,

    suspicions: HashMap<NodeId, u32>,
    primary_suspected: bool,
}

impl std::fmt::Debug for PbftState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PbftState")
            .field("node", self.topology.local())
            .field("view", &self.view)
            .field("sequence", &self.sequence)
            .field("quorum", &self.quorum)
            .field("last_executed", &self.last_executed)
            .finish()
    }
}

impl PbftState {
    /// Create the engine for one node.
    ///
    /// Warns when the cluster is too small for useful Byzantine tolerance:
    /// with `n < 4` the quorum formula degenerates to `f = 0`, `quorum = 1`.
    pub fn new(topology: ClusterTopology, secret: impl Into<String>) -> Self {
        let quorum = topology.pbft_quorum();
        let n = topology.len();
        if n < 4 {
            warn!(
                n,
                quorum,
                "PBFT cluster is smaller than 4 nodes; f = 0, the protocol \
                 runs best-effort and tolerates no Byzantine replicas"
            );
        }
        info!(
            node = %topology.local(),
            n,
            f = topology.max_faulty(),
            quorum,
            primary = %topology.primary_for(0),
            "PBFT engine initialized"
        );
        Self {
            topology,
            secret: secret.into(),
            view: 0,
            sequence: 0,
            quorum,
            sequences: BTreeMap::new(),
            last_executed: 0,
            executed_count: 0,
            suspicions: HashMap::new(),
            primary_suspected: false,
        }
    }

    pub fn view(&self) -> u64 {
        self.view
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn last_executed(&self) -> u64 {
        self.last_executed
    }

    /// The primary of the current view: `all_nodes[view mod n]`.
    pub fn primary(&self) -> &NodeId {
        self.topology.primary_for(self.view)
    }

    pub fn is_primary(&self) -> bool {
        self.topology.is_local(self.primary())
    }

    /// Whether a peer has crossed the Byzantine threshold.
    pub fn is_byzantine(&self, node: &NodeId) -> bool {
        self.suspicions
            .get(node)
            .map(|c| *c >= SUSPICION_THRESHOLD)
            .unwrap_or(false)
    }

    /// Snapshot for the status endpoint.
    pub fn status(&self) -> PbftStatus {
        PbftStatus {
            view: self.view,
            sequence: self.sequence,
            primary: self.primary().clone(),
            is_primary: self.is_primary(),
            f: self.topology.max_faulty(),
            quorum: self.quorum,
            last_executed: self.last_executed,
            executed_count: self.executed_count,
            byzantine_nodes: self
                .suspicions
                .iter()
                .filter(|(_, c)| **c >= SUSPICION_THRESHOLD)
                .map(|(n, _)| n.clone())
                .collect(),
            suspicions: self.suspicions.clone(),
            primary_suspected: self.primary_suspected,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Client entry point
    // ═══════════════════════════════════════════════════════════════════════

    /// Start consensus on a client request. Only the primary assigns
    /// sequence numbers; a replica returns the primary for forwarding.
    pub fn on_client_request(
        &mut self,
        request: serde_json::Value,
    ) -> Result<(PbftReceipt, Vec<PbftAction>), SubmitError> {
        if !self.is_primary() {
            return Err(SubmitError::NotPrimary {
                view: self.view,
                primary: self.primary().clone(),
            });
        }

        self.sequence += 1;
        let sequence = self.sequence;
        let digest = Digest::of_value(&request);
        let pre_prepare = PbftMessage::tagged(
            PbftMessageKind::PrePrepare,
            self.view,
            sequence,
            digest,
            self.topology.local().clone(),
            &self.secret,
            Some(request),
        );

        debug!(
            node = %self.topology.local(),
            sequence,
            %digest,
            "Primary broadcasting pre-prepare"
        );

        // Broadcast to replicas, then run our own copy through the normal
        // acceptance path so the primary contributes its prepare/commit.
        let mut actions = vec![PbftAction::Broadcast(pre_prepare.clone())];
        actions.extend(self.accept_pre_prepare(pre_prepare));

        Ok((
            PbftReceipt {
                status: "accepted",
                sequence,
                digest,
            },
            actions,
        ))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Protocol message handling
    // ═══════════════════════════════════════════════════════════════════════

    /// Handle a protocol message from a peer.
    pub fn handle_message(&mut self, msg: PbftMessage) -> Vec<PbftAction> {
        if self.is_byzantine(&msg.sender) {
            trace!(sender = %msg.sender, "Dropping message from Byzantine peer");
            return vec![];
        }
        if !msg.tag_valid(&self.secret) {
            let sender = msg.sender.clone();
            self.suspect(&sender, "invalid tag");
            return vec![];
        }
        if msg.view != self.view {
            trace!(view = msg.view, current = self.view, "Dropping message from other view");
            return vec![];
        }

        match msg.kind {
            PbftMessageKind::PrePrepare => self.handle_pre_prepare(msg),
            PbftMessageKind::Prepare => self.handle_prepare(msg),
            PbftMessageKind::Commit => self.handle_commit(msg),
        }
    }

    fn handle_pre_prepare(&mut self, msg: PbftMessage) -> Vec<PbftAction> {
        let sender = msg.sender.clone();

        if &sender != self.primary() {
            self.suspect(&sender, "pre-prepare from non-primary");
            return vec![];
        }

        // The embedded request must hash to the claimed digest.
        let request_digest = msg.request.as_ref().map(Digest::of_value);
        if request_digest != Some(msg.digest) {
            self.suspect(&sender, "pre-prepare digest does not match request");
            return vec![];
        }

        // Conflicting pre-prepare for an already-accepted (view, sequence).
        let existing_digest = self
            .sequences
            .get(&msg.sequence)
            .and_then(|s| s.pre_prepare.as_ref())
            .map(|p| p.digest);
        if let Some(existing) = existing_digest {
            if existing != msg.digest {
                self.suspect(&sender, "conflicting pre-prepare");
            }
            // Same digest: duplicate delivery, already handled.
            return vec![];
        }

        self.accept_pre_prepare(msg)
    }

    /// Store an accepted pre-prepare and contribute our own PREPARE.
    fn accept_pre_prepare(&mut self, msg: PbftMessage) -> Vec<PbftAction> {
        let sequence = msg.sequence;
        debug!(
            node = %self.topology.local(),
            sequence,
            sender = %msg.sender,
            "Pre-prepare accepted"
        );

        let prepare = PbftMessage::tagged(
            PbftMessageKind::Prepare,
            self.view,
            sequence,
            msg.digest,
            self.topology.local().clone(),
            &self.secret,
            None,
        );

        let local = self.topology.local().clone();
        let entry = self.sequences.entry(sequence).or_default();
        entry.pre_prepare = Some(msg);
        entry.prepares.insert(local, prepare.clone());

        let mut actions = vec![PbftAction::Broadcast(prepare)];
        // Early-arrived prepares may already complete the quorum.
        actions.extend(self.check_prepared(sequence));
        actions
    }

    fn handle_prepare(&mut self, msg: PbftMessage) -> Vec<PbftAction> {
        let sequence = msg.sequence;
        let sender = msg.sender.clone();

        let mismatch = self
            .sequences
            .get(&sequence)
            .and_then(|e| e.pre_prepare.as_ref())
            .map(|p| p.digest != msg.digest)
            .unwrap_or(false);
        if mismatch {
            self.suspect(&sender, "prepare digest mismatch");
            return vec![];
        }

        let entry = self.sequences.entry(sequence).or_default();
        if entry.prepares.contains_key(&sender) {
            // Duplicate delivery; idempotent.
            return vec![];
        }
        entry.prepares.insert(sender.clone(), msg);
        let count = entry.prepares.len();

        trace!(
            node = %self.topology.local(),
            sequence,
            from = %sender,
            count,
            quorum = self.quorum,
            "Prepare stored"
        );
        self.check_prepared(sequence)
    }

    /// Move to the commit phase once `quorum` matching prepares are stored.
    fn check_prepared(&mut self, sequence: u64) -> Vec<PbftAction> {
        let Some(entry) = self.sequences.get(&sequence) else {
            return vec![];
        };
        let Some(pre_prepare) = &entry.pre_prepare else {
            return vec![];
        };
        if entry.prepared {
            return vec![];
        }

        let digest = pre_prepare.digest;
        let matching = entry
            .prepares
            .values()
            .filter(|p| p.digest == digest)
            .count();
        if matching < self.quorum {
            return vec![];
        }

        debug!(node = %self.topology.local(), sequence, "Prepare quorum reached");
        let commit = PbftMessage::tagged(
            PbftMessageKind::Commit,
            self.view,
            sequence,
            digest,
            self.topology.local().clone(),
            &self.secret,
            None,
        );

        let local = self.topology.local().clone();
        if let Some(entry) = self.sequences.get_mut(&sequence) {
            entry.prepared = true;
            entry.commits.insert(local, commit.clone());
        }

        let mut actions = vec![PbftAction::Broadcast(commit)];
        actions.extend(self.check_committed(sequence));
        actions
    }

    fn handle_commit(&mut self, msg: PbftMessage) -> Vec<PbftAction> {
        let sequence = msg.sequence;
        let sender = msg.sender.clone();

        let mismatch = self
            .sequences
            .get(&sequence)
            .and_then(|e| e.pre_prepare.as_ref())
            .map(|p| p.digest != msg.digest)
            .unwrap_or(false);
        if mismatch {
            self.suspect(&sender, "commit digest mismatch");
            return vec![];
        }

        let entry = self.sequences.entry(sequence).or_default();
        if entry.commits.contains_key(&sender) {
            return vec![];
        }
        entry.commits.insert(sender.clone(), msg);
        let count = entry.commits.len();

        trace!(
            node = %self.topology.local(),
            sequence,
            from = %sender,
            count,
            quorum = self.quorum,
            "Commit stored"
        );
        self.check_committed(sequence)
    }

    /// Mark committed-local once `quorum` matching commits are stored, then
    /// execute everything that is next in sequence order.
    fn check_committed(&mut self, sequence: u64) -> Vec<PbftAction> {
        let Some(entry) = self.sequences.get(&sequence) else {
            return vec![];
        };
        if !entry.prepared || entry.committed {
            return vec![];
        }
        let digest = match &entry.pre_prepare {
            Some(p) => p.digest,
            None => return vec![],
        };
        let matching = entry.commits.values().filter(|c| c.digest == digest).count();
        if matching < self.quorum {
            return vec![];
        }

        debug!(node = %self.topology.local(), sequence, "Commit quorum reached (committed-local)");
        if let Some(entry) = self.sequences.get_mut(&sequence) {
            entry.committed = true;
        }
        self.execute_ready()
    }

    /// Execute committed sequences in strict order: `s` runs only after
    /// `s - 1` has been applied.
    fn execute_ready(&mut self) -> Vec<PbftAction> {
        let mut actions = Vec::new();
        loop {
            let next = self.last_executed + 1;
            let Some(entry) = self.sequences.get_mut(&next) else {
                break;
            };
            if !entry.committed || entry.executed {
                break;
            }

            entry.executed = true;
            let request = entry
                .pre_prepare
                .as_ref()
                .and_then(|p| p.request.clone())
                .unwrap_or(serde_json::Value::Null);

            self.last_executed = next;
            self.executed_count += 1;
            self.primary_suspected = false;

            info!(
                node = %self.topology.local(),
                sequence = next,
                "Executing request"
            );
            actions.push(PbftAction::Executed {
                sequence: next,
                request,
            });
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Suspicion tracking
    // ═══════════════════════════════════════════════════════════════════════

    fn suspect(&mut self, node: &NodeId, reason: &str) {
        let count = self.suspicions.entry(node.clone()).or_insert(0);
        *count += 1;
        warn!(node = %node, reason, count = *count, "Suspicious PBFT behavior");
        if *count == SUSPICION_THRESHOLD {
            warn!(node = %node, "Peer marked Byzantine; dropping its messages from now on");
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Primary timeout (view change is out of scope)
    // ═══════════════════════════════════════════════════════════════════════

    /// Primary-timeout timer fired. If work is stuck behind the primary
    /// (accepted but unexecuted sequences), raise the suspicion flag that
    /// the status endpoint surfaces. No view change is initiated.
    pub fn on_primary_timeout(&mut self) {
        let stuck = self
            .sequences
            .iter()
            .any(|(seq, e)| *seq > self.last_executed && !e.executed);
        if stuck && !self.is_primary() {
            warn!(
                node = %self.topology.local(),
                primary = %self.primary(),
                last_executed = self.last_executed,
                "Primary timeout with pending sequences"
            );
            self.primary_suspected = true;
        }
    }

    /// Advance to the next view. There is no view-change protocol; this is
    /// an operational/test hook so a stalled primary can be rotated out by
    /// external coordination.
    pub fn advance_view(&mut self) {
        self.view += 1;
        self.primary_suspected = false;
        info!(
            node = %self.topology.local(),
            view = self.view,
            primary = %self.primary(),
            "View advanced"
        );
    }
}
