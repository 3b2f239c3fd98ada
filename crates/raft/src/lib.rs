//! Raft replication engine.
//!
//! This crate implements the Raft role machine (Follower / Candidate /
//! Leader) as a synchronous, event-driven model:
//!
//! ```text
//! RPCs and timer events → RaftState::handle_*() → Vec<RaftAction>
//! ```
//!
//! The state machine is:
//! - **Synchronous**: no async, no .await
//! - **Deterministic**: same state + event = same actions; even election
//!   timeout randomness lives outside, in the driver
//! - **Pure-ish**: mutates self, but performs no I/O
//!
//! All I/O is handled by the node driver, which delivers peer RPCs and timer
//! fires as method calls, executes the returned actions (send RPCs, arm and
//! cancel timers), and feeds RPC responses back in.
//!
//! The engine is generic over the command type carried by the log; it never
//! inspects commands, it only replicates them and hands them back in commit
//! order via [`RaftAction::Apply`].

mod config;
mod messages;
mod state;

pub use config::{RaftConfig, RaftConfigError};
pub use messages::{
    AppendEntriesRequest, AppendEntriesResponse, LogEntry, RequestVoteRequest, RequestVoteResponse,
};
pub use state::{RaftAction, RaftRole, RaftState, RaftStatus, SubmitError};
