//! Lock commands carried by the Raft log.

use concord_types::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Shared/exclusive lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    /// Parse the client-facing query value (`shared` / `exclusive`).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "shared" => Some(LockMode::Shared),
            "exclusive" => Some(LockMode::Exclusive),
            _ => None,
        }
    }

    /// The client-facing query value.
    pub fn query_value(&self) -> &'static str {
        match self {
            LockMode::Shared => "shared",
            LockMode::Exclusive => "exclusive",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => f.write_str("SHARED"),
            LockMode::Exclusive => f.write_str("EXCLUSIVE"),
        }
    }
}

/// A replicated lock operation.
///
/// Commands are opaque to the Raft engine; they gain meaning only when the
/// committed log is applied to the [`LockTable`](crate::LockTable).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LockCommand {
    Acquire {
        name: String,
        mode: LockMode,
        requester: NodeId,
    },
    Release {
        name: String,
        requester: NodeId,
    },
}

impl LockCommand {
    pub fn name(&self) -> &str {
        match self {
            LockCommand::Acquire { name, .. } | LockCommand::Release { name, .. } => name,
        }
    }

    pub fn requester(&self) -> &NodeId {
        match self {
            LockCommand::Acquire { requester, .. } | LockCommand::Release { requester, .. } => {
                requester
            }
        }
    }
}
