//! The lock table state machine.

use crate::command::{LockCommand, LockMode};
use concord_types::NodeId;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

/// A queued acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Waiter {
    pub node: NodeId,
    pub mode: LockMode,
}

/// One named lock.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LockRecord {
    mode: LockMode,
    /// Ordered set of holders; size 1 when `mode` is EXCLUSIVE.
    holders: Vec<NodeId>,
    /// FIFO queue of waiters. Waiters are never also holders.
    waiters: Vec<Waiter>,
}

/// Serializable view of one lock, for the status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct LockRecordView {
    #[serde(rename = "type")]
    pub mode: LockMode,
    pub holders: Vec<NodeId>,
    pub waiters: Vec<Waiter>,
}

/// What applying a committed command did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The requester now holds the lock.
    Granted,
    /// The requester was appended to the waiters queue.
    Queued,
    /// The requester released its hold; these waiters were promoted.
    Released { promoted: Vec<NodeId> },
    /// Release of a lock the requester did not hold; applied as a no-op.
    NotHeld,
}

/// A state the table believes unreachable. Fatal: the caller must stop
/// applying and take the node out of service.
#[derive(Debug, Error)]
pub enum LockTableError {
    #[error("invariant violation applying {command:?}: {detail}")]
    InvariantViolation {
        command: Box<LockCommand>,
        detail: String,
    },
}

/// The replicated lock table.
///
/// A pure function of the committed log prefix: the only mutator is
/// [`LockTable::apply`], called in log order with committed commands.
/// Uses `BTreeMap` so snapshots render in a stable order.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: BTreeMap<String, LockRecord>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one committed command, returning what it did.
    pub fn apply(&mut self, command: &LockCommand) -> Result<ApplyOutcome, LockTableError> {
        let outcome = match command {
            LockCommand::Acquire {
                name,
                mode,
                requester,
            } => self.apply_acquire(name, *mode, requester),
            LockCommand::Release { name, requester } => self.apply_release(name, requester),
        };
        self.check_invariants(command)?;
        Ok(outcome)
    }

    fn apply_acquire(&mut self, name: &str, mode: LockMode, requester: &NodeId) -> ApplyOutcome {
        let record = self.locks.entry(name.to_string()).or_insert(LockRecord {
            mode,
            holders: Vec::new(),
            waiters: Vec::new(),
        });

        if record.holders.is_empty() && record.waiters.is_empty() {
            record.mode = mode;
            record.holders.push(requester.clone());
            debug!(lock = name, %requester, %mode, "Lock granted");
            return ApplyOutcome::Granted;
        }

        // Re-entrant acquire by a current holder is an idempotent grant.
        if record.holders.contains(requester) {
            return ApplyOutcome::Granted;
        }

        // A shared request joins shared holders, but only while no waiter is
        // queued ahead: otherwise readers arriving forever would starve a
        // waiting writer.
        if mode == LockMode::Shared
            && record.mode == LockMode::Shared
            && record.waiters.is_empty()
        {
            record.holders.push(requester.clone());
            debug!(lock = name, %requester, "Shared lock joined");
            return ApplyOutcome::Granted;
        }

        if !record
            .waiters
            .iter()
            .any(|w| &w.node == requester && w.mode == mode)
        {
            record.waiters.push(Waiter {
                node: requester.clone(),
                mode,
            });
        }
        debug!(lock = name, %requester, %mode, "Lock busy, requester queued");
        ApplyOutcome::Queued
    }

    fn apply_release(&mut self, name: &str, requester: &NodeId) -> ApplyOutcome {
        let Some(record) = self.locks.get_mut(name) else {
            return ApplyOutcome::NotHeld;
        };
        let Some(pos) = record.holders.iter().position(|h| h == requester) else {
            return ApplyOutcome::NotHeld;
        };
        record.holders.remove(pos);
        debug!(lock = name, %requester, "Lock released");

        let mut promoted = Vec::new();
        if record.holders.is_empty() {
            promoted = Self::promote_waiters(record);
            if !promoted.is_empty() {
                info!(lock = name, ?promoted, "Waiters promoted to holders");
            }
        }

        if record.holders.is_empty() && record.waiters.is_empty() {
            self.locks.remove(name);
        }
        ApplyOutcome::Released { promoted }
    }

    /// Promote the longest mutually compatible prefix of the waiter queue:
    /// a single exclusive waiter alone, or a run of consecutive shared
    /// waiters. Remaining waiters keep their positions.
    fn promote_waiters(record: &mut LockRecord) -> Vec<NodeId> {
        let Some(first) = record.waiters.first() else {
            return Vec::new();
        };

        let take = match first.mode {
            LockMode::Exclusive => 1,
            LockMode::Shared => record
                .waiters
                .iter()
                .take_while(|w| w.mode == LockMode::Shared)
                .count(),
        };

        record.mode = first.mode;
        let promoted: Vec<NodeId> = record
            .waiters
            .drain(..take)
            .map(|w| w.node)
            .collect();
        record.holders.extend(promoted.iter().cloned());
        promoted
    }

    fn check_invariants(&self, command: &LockCommand) -> Result<(), LockTableError> {
        for (name, record) in &self.locks {
            if record.mode == LockMode::Exclusive && record.holders.len() > 1 {
                return Err(LockTableError::InvariantViolation {
                    command: Box::new(command.clone()),
                    detail: format!("lock '{name}' is EXCLUSIVE with {} holders", record.holders.len()),
                });
            }
            if record
                .waiters
                .iter()
                .any(|w| record.holders.contains(&w.node))
            {
                return Err(LockTableError::InvariantViolation {
                    command: Box::new(command.clone()),
                    detail: format!("lock '{name}' has a waiter that is also a holder"),
                });
            }
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════

    /// Snapshot of one lock.
    pub fn status(&self, name: &str) -> Option<LockRecordView> {
        self.locks.get(name).map(|r| LockRecordView {
            mode: r.mode,
            holders: r.holders.clone(),
            waiters: r.waiters.clone(),
        })
    }

    /// Snapshot of every lock, in name order.
    pub fn list(&self) -> BTreeMap<String, LockRecordView> {
        self.locks
            .keys()
            .filter_map(|name| self.status(name).map(|view| (name.clone(), view)))
            .collect()
    }

    /// Whether an acquire would be granted right now, mirroring the grant
    /// rule in [`LockTable::apply`]. Used by the leader to decide whether a
    /// deadlock check is needed before appending the command.
    pub fn would_grant(&self, name: &str, mode: LockMode, requester: &NodeId) -> bool {
        match self.locks.get(name) {
            None => true,
            Some(record) => {
                if record.holders.is_empty() && record.waiters.is_empty() {
                    true
                } else if record.holders.contains(requester) {
                    true
                } else {
                    mode == LockMode::Shared
                        && record.mode == LockMode::Shared
                        && record.waiters.is_empty()
                }
            }
        }
    }

    /// Whether `node` currently holds `name`.
    pub fn is_holder(&self, name: &str, node: &NodeId) -> bool {
        self.locks
            .get(name)
            .map(|r| r.holders.contains(node))
            .unwrap_or(false)
    }

    /// Current holders of `name`.
    pub fn holders(&self, name: &str) -> Vec<NodeId> {
        self.locks
            .get(name)
            .map(|r| r.holders.clone())
            .unwrap_or_default()
    }

    /// All waiter → holder pairs, for wait-for graph derivation.
    pub fn wait_edges(&self) -> impl Iterator<Item = (&NodeId, &NodeId)> {
        self.locks.values().flat_map(|record| {
            record
                .waiters
                .iter()
                .flat_map(move |w| record.holders.iter().map(move |h| (&w.node, h)))
        })
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
