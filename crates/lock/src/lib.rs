//! Replicated lock table.
//!
//! This crate is the state machine that sits atop the Raft engine: lock
//! commands come out of the committed log and are applied, in log order, to
//! a [`LockTable`]. Applying is deterministic and is the only mutator of
//! lock state, so every node that has applied the same committed prefix
//! holds an identical table.
//!
//! Deadlock is refused, not blocked: before appending an acquire that would
//! wait, the leader derives the [`WaitForGraph`] from its applied table,
//! adds the proposed requester→holder edges, and rejects the command if a
//! cycle appears. The graph is always recomputed from the table and never
//! stored, so the two can never disagree.

mod command;
mod table;
mod waitfor;

pub use command::{LockCommand, LockMode};
pub use table::{ApplyOutcome, LockRecordView, LockTable, LockTableError, Waiter};
pub use waitfor::WaitForGraph;
