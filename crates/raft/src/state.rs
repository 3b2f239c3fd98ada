//! The Raft role machine.

use crate::messages::{
    AppendEntriesRequest, AppendEntriesResponse, LogEntry, RequestVoteRequest, RequestVoteResponse,
};
use concord_types::NodeId;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use thiserror::Error;
use tracing::{debug, info, trace};

/// The three Raft roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

/// Actions the role machine wants the driver to perform.
///
/// Actions are commands; the driver executes them and feeds results back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftAction<C> {
    /// (Re)arm the election timer with a freshly drawn random timeout.
    ResetElectionTimer,

    /// Cancel the election timer (on assuming leadership).
    CancelElectionTimer,

    /// Start the periodic heartbeat tick (on assuming leadership).
    StartHeartbeats,

    /// Stop the heartbeat tick (on losing leadership).
    StopHeartbeats,

    /// Send a vote solicitation to every peer.
    BroadcastVoteRequest(RequestVoteRequest),

    /// Send an AppendEntries RPC to one peer.
    SendAppend {
        peer: NodeId,
        request: AppendEntriesRequest<C>,
    },

    /// A log entry has committed; apply it to the state machine, in order.
    Apply { index: u64, command: C },
}

/// Error from submitting a command on a non-leader.
#[derive(Debug, Clone, Error)]
pub enum SubmitError {
    #[error("not the leader (known leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },
}

/// Point-in-time snapshot of the engine, for the status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct RaftStatus {
    pub role: RaftRole,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub last_log_index: u64,
    pub commit_index: u64,
    pub last_applied: u64,
}

/// Raft role machine for one node.
///
/// # State Machine Flow
///
/// 1. **Election timer fires** → become candidate, solicit votes
/// 2. **Majority of votes** → become leader, assert with empty appends
/// 3. **Heartbeat tick** → leader replicates from each peer's `next_index`
/// 4. **Append responses** → advance `match_index`, commit on majority
/// 5. **Commit advances** → emit `Apply` actions in log order
///
/// Commands are opaque; the lock table (or any other state machine) applies
/// them downstream.
pub struct RaftState<C> {
    // ═══════════════════════════════════════════════════════════════════════
    // Identity
    // ═══════════════════════════════════════════════════════════════════════
    id: NodeId,
    peers: Vec<NodeId>,
    /// Votes needed for a strict majority of the full cluster.
    majority: usize,

    // ═══════════════════════════════════════════════════════════════════════
    // Role state
    // ═══════════════════════════════════════════════════════════════════════
    role: RaftRole,
    current_term: u64,
    voted_for: Option<NodeId>,
    leader: Option<NodeId>,
    /// Peers (and self) that granted a vote in the current candidacy.
    votes_received: HashSet<NodeId>,

    // ═══════════════════════════════════════════════════════════════════════
    // Log state
    // ═══════════════════════════════════════════════════════════════════════
    log: Vec<LogEntry<C>>,
    commit_index: u64,
    last_applied: u64,

    // ═══════════════════════════════════════════════════════════════════════
    // Leader replication progress
    // ═══════════════════════════════════════════════════════════════════════
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
}

impl<C> Debug for RaftState<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftState")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("term", &self.current_term)
            .field("leader", &self.leader)
            .field("log_len", &self.log.len())
            .field("commit_index", &self.commit_index)
            .finish()
    }
}

impl<C: Clone + Debug> RaftState<C> {
    /// Create a fresh follower.
    pub fn new(id: NodeId, peers: Vec<NodeId>) -> Self {
        let n = peers.len() + 1;
        Self {
            id,
            peers,
            majority: n / 2 + 1,
            role: RaftRole::Follower,
            current_term: 0,
            voted_for: None,
            leader: None,
            votes_received: HashSet::new(),
            log: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        }
    }

    /// Actions to start the engine: arm the first election timer.
    pub fn start(&self) -> Vec<RaftAction<C>> {
        vec![RaftAction::ResetElectionTimer]
    }

    pub fn role(&self) -> RaftRole {
        self.role
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn leader(&self) -> Option<&NodeId> {
        self.leader.as_ref()
    }

    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    /// Snapshot for the status endpoints.
    pub fn status(&self) -> RaftStatus {
        RaftStatus {
            role: self.role,
            term: self.current_term,
            leader: self.leader.clone(),
            last_log_index: self.last_log_index(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
        }
    }

    fn last_log_index(&self) -> u64 {
        self.log.len() as u64
    }

    fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            Some(0)
        } else {
            self.log.get(index as usize - 1).map(|e| e.term)
        }
    }

    /// Adopt a higher term and revert to follower.
    fn step_down(&mut self, term: u64) -> Vec<RaftAction<C>> {
        let was_leader = self.role == RaftRole::Leader;
        debug!(
            node = %self.id,
            old_term = self.current_term,
            new_term = term,
            was_leader,
            "Observed higher term, stepping down"
        );
        self.current_term = term;
        self.voted_for = None;
        self.role = RaftRole::Follower;
        self.votes_received.clear();
        // The new term's leader is unknown until it announces itself.
        self.leader = None;

        let mut actions = Vec::new();
        if was_leader {
            actions.push(RaftAction::StopHeartbeats);
        }
        actions.push(RaftAction::ResetElectionTimer);
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Election
    // ═══════════════════════════════════════════════════════════════════════

    /// The election timer elapsed without a valid heartbeat: stand for
    /// election. Fires again on a split vote, incrementing the term anew.
    pub fn on_election_timeout(&mut self) -> Vec<RaftAction<C>> {
        if self.role == RaftRole::Leader {
            // A stale timer fire; leaders do not run an election timer.
            return vec![];
        }

        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id.clone());
        self.leader = None;
        self.votes_received.clear();
        self.votes_received.insert(self.id.clone());

        info!(node = %self.id, term = self.current_term, "Standing for election");

        if self.votes_received.len() >= self.majority {
            // Single-node cluster: own vote is already a majority.
            return self.become_leader();
        }

        vec![
            RaftAction::ResetElectionTimer,
            RaftAction::BroadcastVoteRequest(RequestVoteRequest {
                term: self.current_term,
                candidate_id: self.id.clone(),
                last_log_index: self.last_log_index(),
                last_log_term: self.last_log_term(),
            }),
        ]
    }

    /// Handle a vote solicitation from a candidate.
    pub fn handle_request_vote(
        &mut self,
        req: &RequestVoteRequest,
    ) -> (RequestVoteResponse, Vec<RaftAction<C>>) {
        if req.term < self.current_term {
            return (
                RequestVoteResponse {
                    term: self.current_term,
                    vote_granted: false,
                },
                vec![],
            );
        }

        let mut actions = if req.term > self.current_term {
            self.step_down(req.term)
        } else {
            vec![]
        };

        // Election safety: only vote for a candidate whose log is at least
        // as up-to-date as ours.
        let log_ok = req.last_log_term > self.last_log_term()
            || (req.last_log_term == self.last_log_term()
                && req.last_log_index >= self.last_log_index());

        let may_vote = self
            .voted_for
            .as_ref()
            .map(|v| v == &req.candidate_id)
            .unwrap_or(true);

        let vote_granted = log_ok && may_vote;
        if vote_granted {
            self.voted_for = Some(req.candidate_id.clone());
            actions.push(RaftAction::ResetElectionTimer);
            debug!(node = %self.id, candidate = %req.candidate_id, term = req.term, "Vote granted");
        } else {
            trace!(
                node = %self.id,
                candidate = %req.candidate_id,
                term = req.term,
                log_ok,
                voted_for = ?self.voted_for,
                "Vote refused"
            );
        }

        (
            RequestVoteResponse {
                term: self.current_term,
                vote_granted,
            },
            actions,
        )
    }

    /// Handle a vote reply while campaigning.
    pub fn on_vote_response(
        &mut self,
        from: &NodeId,
        resp: &RequestVoteResponse,
    ) -> Vec<RaftAction<C>> {
        if resp.term > self.current_term {
            return self.step_down(resp.term);
        }
        if self.role != RaftRole::Candidate || resp.term < self.current_term {
            return vec![];
        }
        if !resp.vote_granted {
            return vec![];
        }

        self.votes_received.insert(from.clone());
        trace!(
            node = %self.id,
            from = %from,
            votes = self.votes_received.len(),
            needed = self.majority,
            "Vote received"
        );

        if self.votes_received.len() >= self.majority {
            self.become_leader()
        } else {
            vec![]
        }
    }

    fn become_leader(&mut self) -> Vec<RaftAction<C>> {
        self.role = RaftRole::Leader;
        self.leader = Some(self.id.clone());

        let next = self.last_log_index() + 1;
        for peer in &self.peers {
            self.next_index.insert(peer.clone(), next);
            self.match_index.insert(peer.clone(), 0);
        }

        info!(node = %self.id, term = self.current_term, "Elected leader");

        // Assert leadership immediately with an (initially empty) append to
        // every peer, ahead of the first heartbeat tick.
        let mut actions = vec![RaftAction::CancelElectionTimer, RaftAction::StartHeartbeats];
        for peer in self.peers.clone() {
            actions.push(self.build_append(&peer));
        }
        // A lone node has no peers to wait for; commit what it has.
        actions.extend(self.advance_commit());
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Replication
    // ═══════════════════════════════════════════════════════════════════════

    /// Heartbeat tick: replicate to every peer from its `next_index`.
    pub fn on_heartbeat_tick(&mut self) -> Vec<RaftAction<C>> {
        if self.role != RaftRole::Leader {
            return vec![];
        }
        self.peers
            .clone()
            .iter()
            .map(|peer| self.build_append(peer))
            .collect()
    }

    fn build_append(&self, peer: &NodeId) -> RaftAction<C> {
        let next = self
            .next_index
            .get(peer)
            .copied()
            .unwrap_or(self.last_log_index() + 1);
        let prev_log_index = next - 1;
        let prev_log_term = self.term_at(prev_log_index).unwrap_or(0);
        let entries = self.log[prev_log_index as usize..].to_vec();

        RaftAction::SendAppend {
            peer: peer.clone(),
            request: AppendEntriesRequest {
                term: self.current_term,
                leader_id: self.id.clone(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.commit_index,
            },
        }
    }

    /// Handle replication (or heartbeat) from a leader.
    pub fn handle_append_entries(
        &mut self,
        req: &AppendEntriesRequest<C>,
    ) -> (AppendEntriesResponse, Vec<RaftAction<C>>) {
        if req.term < self.current_term {
            return (
                AppendEntriesResponse {
                    term: self.current_term,
                    success: false,
                    match_index: 0,
                },
                vec![],
            );
        }

        let mut actions = if req.term > self.current_term {
            self.step_down(req.term)
        } else {
            vec![]
        };

        // A valid append in the current term: the sender is the leader.
        if self.role == RaftRole::Candidate {
            self.role = RaftRole::Follower;
            self.votes_received.clear();
        }
        self.leader = Some(req.leader_id.clone());
        actions.push(RaftAction::ResetElectionTimer);

        // Consistency check at prev_log_index.
        if self.term_at(req.prev_log_index) != Some(req.prev_log_term) {
            trace!(
                node = %self.id,
                prev_log_index = req.prev_log_index,
                "Append rejected: log mismatch at prev index"
            );
            return (
                AppendEntriesResponse {
                    term: self.current_term,
                    success: false,
                    match_index: 0,
                },
                actions,
            );
        }

        // Truncate any conflicting suffix, append the rest.
        let mut insert = req.prev_log_index as usize;
        for entry in &req.entries {
            if let Some(existing) = self.log.get(insert) {
                if existing.term != entry.term {
                    self.log.truncate(insert);
                    self.log.push(entry.clone());
                }
                // Same term at same index: identical by log matching, keep.
            } else {
                self.log.push(entry.clone());
            }
            insert += 1;
        }

        let last_new = req.prev_log_index + req.entries.len() as u64;
        if req.leader_commit > self.commit_index {
            self.commit_index = req.leader_commit.min(self.last_log_index());
            actions.extend(self.drain_applies());
        }

        (
            AppendEntriesResponse {
                term: self.current_term,
                success: true,
                match_index: last_new,
            },
            actions,
        )
    }

    /// Handle a replication reply on the leader.
    pub fn on_append_response(
        &mut self,
        from: &NodeId,
        resp: &AppendEntriesResponse,
    ) -> Vec<RaftAction<C>> {
        if resp.term > self.current_term {
            return self.step_down(resp.term);
        }
        if self.role != RaftRole::Leader || resp.term < self.current_term {
            return vec![];
        }

        if resp.success {
            self.match_index.insert(from.clone(), resp.match_index);
            self.next_index.insert(from.clone(), resp.match_index + 1);
            self.advance_commit()
        } else {
            // Walk next_index back one step; the next heartbeat retries.
            let next = self.next_index.entry(from.clone()).or_insert(1);
            *next = (*next).saturating_sub(1).max(1);
            trace!(node = %self.id, peer = %from, next_index = *next, "Append rejected, backing off");
            vec![]
        }
    }

    /// Advance `commit_index` to the highest current-term index replicated
    /// on a majority. Entries from earlier terms commit transitively.
    fn advance_commit(&mut self) -> Vec<RaftAction<C>> {
        for n in (self.commit_index + 1..=self.last_log_index()).rev() {
            if self.term_at(n) != Some(self.current_term) {
                continue;
            }
            let replicated = 1 + self
                .peers
                .iter()
                .filter(|p| self.match_index.get(*p).copied().unwrap_or(0) >= n)
                .count();
            if replicated >= self.majority {
                debug!(node = %self.id, commit_index = n, "Commit index advanced");
                self.commit_index = n;
                break;
            }
        }
        self.drain_applies()
    }

    /// Emit `Apply` actions for every committed-but-unapplied entry.
    fn drain_applies(&mut self) -> Vec<RaftAction<C>> {
        let mut actions = Vec::new();
        while self.last_applied < self.commit_index {
            self.last_applied += 1;
            let entry = &self.log[self.last_applied as usize - 1];
            actions.push(RaftAction::Apply {
                index: entry.index,
                command: entry.command.clone(),
            });
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Client writes
    // ═══════════════════════════════════════════════════════════════════════

    /// Append a command to the leader's log and start replicating it.
    ///
    /// Returns the assigned index; the command is *not yet committed*. The
    /// caller learns of commitment through the `Apply` action for that index.
    pub fn submit(&mut self, command: C) -> Result<(u64, Vec<RaftAction<C>>), SubmitError> {
        if self.role != RaftRole::Leader {
            return Err(SubmitError::NotLeader {
                leader: self.leader.clone(),
            });
        }

        let index = self.last_log_index() + 1;
        self.log.push(LogEntry {
            term: self.current_term,
            index,
            command,
        });
        debug!(node = %self.id, index, term = self.current_term, "Command appended");

        let mut actions: Vec<RaftAction<C>> = self
            .peers
            .clone()
            .iter()
            .map(|peer| self.build_append(peer))
            .collect();
        // A lone node commits immediately.
        actions.extend(self.advance_commit());
        Ok((index, actions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestState = RaftState<serde_json::Value>;

    fn cmd(tag: &str) -> serde_json::Value {
        serde_json::json!({ "op": tag })
    }

    fn node(id: &str) -> NodeId {
        NodeId::new(id)
    }

    fn three_node(id: &str) -> TestState {
        let peers = ["a", "b", "c"]
            .iter()
            .filter(|p| **p != id)
            .map(|p| node(p))
            .collect();
        RaftState::new(node(id), peers)
    }

    /// Drive a candidate to leadership with votes from all peers.
    fn make_leader(state: &mut TestState) {
        state.on_election_timeout();
        let peers: Vec<NodeId> = state.peers.clone();
        for peer in peers {
            let resp = RequestVoteResponse {
                term: state.current_term(),
                vote_granted: true,
            };
            state.on_vote_response(&peer, &resp);
        }
        assert!(state.is_leader());
    }

    #[test]
    fn election_timeout_starts_candidacy() {
        let mut s = three_node("a");
        let actions = s.on_election_timeout();
        assert_eq!(s.role(), RaftRole::Candidate);
        assert_eq!(s.current_term(), 1);
        assert!(actions
            .iter()
            .any(|a| matches!(a, RaftAction::BroadcastVoteRequest(r) if r.term == 1)));
        assert!(actions
            .iter()
            .any(|a| matches!(a, RaftAction::ResetElectionTimer)));
    }

    #[test]
    fn split_vote_increments_term() {
        let mut s = three_node("a");
        s.on_election_timeout();
        s.on_election_timeout();
        assert_eq!(s.current_term(), 2);
        assert_eq!(s.role(), RaftRole::Candidate);
    }

    #[test]
    fn majority_votes_elect_leader() {
        let mut s = three_node("a");
        s.on_election_timeout();
        // One grant plus own vote = 2 of 3.
        let actions = s.on_vote_response(
            &node("b"),
            &RequestVoteResponse {
                term: 1,
                vote_granted: true,
            },
        );
        assert!(s.is_leader());
        assert!(actions
            .iter()
            .any(|a| matches!(a, RaftAction::StartHeartbeats)));
        assert!(actions
            .iter()
            .any(|a| matches!(a, RaftAction::CancelElectionTimer)));
        // Leadership asserted with an append per peer.
        let appends = actions
            .iter()
            .filter(|a| matches!(a, RaftAction::SendAppend { .. }))
            .count();
        assert_eq!(appends, 2);
    }

    #[test]
    fn exactly_half_is_not_a_majority() {
        // Four nodes: 2 votes (own + one grant) must NOT elect; 3 must.
        let peers = vec![node("b"), node("c"), node("d")];
        let mut s: TestState = RaftState::new(node("a"), peers);
        s.on_election_timeout();
        s.on_vote_response(
            &node("b"),
            &RequestVoteResponse {
                term: 1,
                vote_granted: true,
            },
        );
        assert!(!s.is_leader());
        s.on_vote_response(
            &node("c"),
            &RequestVoteResponse {
                term: 1,
                vote_granted: true,
            },
        );
        assert!(s.is_leader());
    }

    #[test]
    fn single_node_elects_itself_and_commits() {
        let mut s: TestState = RaftState::new(node("solo"), vec![]);
        s.on_election_timeout();
        assert!(s.is_leader());
        let (index, actions) = s.submit(cmd("x")).unwrap();
        assert_eq!(index, 1);
        assert!(actions
            .iter()
            .any(|a| matches!(a, RaftAction::Apply { index: 1, .. })));
        assert_eq!(s.commit_index(), 1);
    }

    #[test]
    fn vote_rejected_for_stale_term() {
        let mut s = three_node("a");
        s.on_election_timeout(); // term 1, voted for self
        let (resp, _) = s.handle_request_vote(&RequestVoteRequest {
            term: 0,
            candidate_id: node("b"),
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(!resp.vote_granted);
        assert_eq!(resp.term, 1);
    }

    #[test]
    fn vote_granted_once_per_term() {
        let mut s = three_node("a");
        let req = |candidate: &str| RequestVoteRequest {
            term: 1,
            candidate_id: node(candidate),
            last_log_index: 0,
            last_log_term: 0,
        };
        let (resp, actions) = s.handle_request_vote(&req("b"));
        assert!(resp.vote_granted);
        assert!(actions
            .iter()
            .any(|a| matches!(a, RaftAction::ResetElectionTimer)));
        // Same term, different candidate: refused.
        let (resp, _) = s.handle_request_vote(&req("c"));
        assert!(!resp.vote_granted);
        // Same candidate again: idempotent grant.
        let (resp, _) = s.handle_request_vote(&req("b"));
        assert!(resp.vote_granted);
    }

    #[test]
    fn vote_refused_to_stale_log() {
        let mut s = three_node("a");
        // Seed a log entry at term 1 via an append from a leader.
        let (resp, _) = s.handle_append_entries(&AppendEntriesRequest {
            term: 1,
            leader_id: node("b"),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![LogEntry {
                term: 1,
                index: 1,
                command: cmd("seed"),
            }],
            leader_commit: 0,
        });
        assert!(resp.success);

        // Candidate with an older log term: refused even at a newer term.
        let (resp, _) = s.handle_request_vote(&RequestVoteRequest {
            term: 2,
            candidate_id: node("c"),
            last_log_index: 5,
            last_log_term: 0,
        });
        assert!(!resp.vote_granted);

        // Candidate with same last term but shorter log: refused.
        let (resp, _) = s.handle_request_vote(&RequestVoteRequest {
            term: 3,
            candidate_id: node("c"),
            last_log_index: 0,
            last_log_term: 1,
        });
        assert!(!resp.vote_granted);

        // Candidate at least as up-to-date: granted.
        let (resp, _) = s.handle_request_vote(&RequestVoteRequest {
            term: 4,
            candidate_id: node("c"),
            last_log_index: 1,
            last_log_term: 1,
        });
        assert!(resp.vote_granted);
    }

    #[test]
    fn append_from_current_leader_resets_candidate() {
        let mut s = three_node("a");
        s.on_election_timeout(); // candidate at term 1
        let (resp, actions) = s.handle_append_entries(&AppendEntriesRequest {
            term: 1,
            leader_id: node("b"),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        });
        assert!(resp.success);
        assert_eq!(s.role(), RaftRole::Follower);
        assert_eq!(s.leader(), Some(&node("b")));
        assert!(actions
            .iter()
            .any(|a| matches!(a, RaftAction::ResetElectionTimer)));
    }

    #[test]
    fn append_rejects_gap() {
        let mut s = three_node("a");
        let (resp, _) = s.handle_append_entries(&AppendEntriesRequest {
            term: 1,
            leader_id: node("b"),
            prev_log_index: 5,
            prev_log_term: 1,
            entries: vec![],
            leader_commit: 0,
        });
        assert!(!resp.success);
        assert_eq!(resp.term, 1);
    }

    #[test]
    fn append_truncates_conflicting_suffix() {
        let mut s = three_node("a");
        // Entries 1..=3 at term 1.
        let entries: Vec<_> = (1..=3)
            .map(|i| LogEntry {
                term: 1,
                index: i,
                command: cmd(&format!("old-{i}")),
            })
            .collect();
        s.handle_append_entries(&AppendEntriesRequest {
            term: 1,
            leader_id: node("b"),
            prev_log_index: 0,
            prev_log_term: 0,
            entries,
            leader_commit: 0,
        });
        assert_eq!(s.last_log_index(), 3);

        // New leader at term 2 overwrites from index 2.
        let (resp, _) = s.handle_append_entries(&AppendEntriesRequest {
            term: 2,
            leader_id: node("c"),
            prev_log_index: 1,
            prev_log_term: 1,
            entries: vec![LogEntry {
                term: 2,
                index: 2,
                command: cmd("new-2"),
            }],
            leader_commit: 0,
        });
        assert!(resp.success);
        assert_eq!(resp.match_index, 2);
        assert_eq!(s.last_log_index(), 2);
        assert_eq!(s.log[1].term, 2);
    }

    #[test]
    fn follower_applies_up_to_leader_commit() {
        let mut s = three_node("a");
        let entries: Vec<_> = (1..=3)
            .map(|i| LogEntry {
                term: 1,
                index: i,
                command: cmd(&format!("c{i}")),
            })
            .collect();
        let (resp, actions) = s.handle_append_entries(&AppendEntriesRequest {
            term: 1,
            leader_id: node("b"),
            prev_log_index: 0,
            prev_log_term: 0,
            entries,
            leader_commit: 2,
        });
        assert!(resp.success);
        let applied: Vec<u64> = actions
            .iter()
            .filter_map(|a| match a {
                RaftAction::Apply { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(applied, vec![1, 2]);
        assert_eq!(s.commit_index(), 2);
    }

    #[test]
    fn leader_commits_on_majority_match() {
        let mut s = three_node("a");
        make_leader(&mut s);
        let (index, _) = s.submit(cmd("w")).unwrap();
        assert_eq!(s.commit_index(), 0);

        // First peer ack: 2 of 3 including leader → committed.
        let resp = AppendEntriesResponse {
            term: 1,
            success: true,
            match_index: index,
        };
        let actions = s.on_append_response(&node("b"), &resp);
        assert_eq!(s.commit_index(), index);
        assert!(actions
            .iter()
            .any(|a| matches!(a, RaftAction::Apply { index: i, .. } if *i == index)));
    }

    #[test]
    fn leader_steps_down_on_higher_term() {
        let mut s = three_node("a");
        make_leader(&mut s);
        let actions = s.on_append_response(
            &node("b"),
            &AppendEntriesResponse {
                term: 9,
                success: false,
                match_index: 0,
            },
        );
        assert_eq!(s.role(), RaftRole::Follower);
        assert_eq!(s.current_term(), 9);
        assert!(actions
            .iter()
            .any(|a| matches!(a, RaftAction::StopHeartbeats)));
        assert!(matches!(
            s.submit(cmd("late")),
            Err(SubmitError::NotLeader { .. })
        ));
    }

    #[test]
    fn failed_append_backs_off_next_index() {
        let mut s = three_node("a");
        make_leader(&mut s);
        s.submit(cmd("one")).unwrap();
        // b acknowledges entry 1, advancing next_index[b] to 2.
        s.on_append_response(
            &node("b"),
            &AppendEntriesResponse {
                term: 1,
                success: true,
                match_index: 1,
            },
        );
        assert_eq!(*s.next_index.get(&node("b")).unwrap(), 2);

        s.submit(cmd("two")).unwrap();
        s.on_append_response(
            &node("b"),
            &AppendEntriesResponse {
                term: 1,
                success: false,
                match_index: 0,
            },
        );
        assert_eq!(*s.next_index.get(&node("b")).unwrap(), 1);

        // The retry append must now carry the log from the start.
        let actions = s.on_heartbeat_tick();
        let to_b = actions.iter().find_map(|a| match a {
            RaftAction::SendAppend { peer, request } if peer == &node("b") => Some(request),
            _ => None,
        });
        let request = to_b.unwrap();
        assert_eq!(request.prev_log_index, 0);
        assert_eq!(request.entries.len(), 2);
    }

    #[test]
    fn heartbeat_is_empty_when_caught_up() {
        let mut s = three_node("a");
        make_leader(&mut s);
        let actions = s.on_heartbeat_tick();
        for action in actions {
            if let RaftAction::SendAppend { request, .. } = action {
                assert!(request.entries.is_empty());
            }
        }
    }

    #[test]
    fn duplicate_append_delivery_is_idempotent() {
        let mut s = three_node("a");
        let req = AppendEntriesRequest {
            term: 1,
            leader_id: node("b"),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![LogEntry {
                term: 1,
                index: 1,
                command: cmd("dup"),
            }],
            leader_commit: 1,
        };
        let (first, actions) = s.handle_append_entries(&req);
        assert!(first.success);
        assert_eq!(
            actions
                .iter()
                .filter(|a| matches!(a, RaftAction::Apply { .. }))
                .count(),
            1
        );
        let (second, actions) = s.handle_append_entries(&req);
        assert!(second.success);
        assert_eq!(second.match_index, 1);
        assert_eq!(s.last_log_index(), 1);
        // Already applied; no duplicate Apply.
        assert!(!actions.iter().any(|a| matches!(a, RaftAction::Apply { .. })));
    }
}
