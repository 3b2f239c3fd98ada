//! PBFT engine.
//!
//! This crate implements a Practical Byzantine Fault Tolerance engine as a
//! synchronous, event-driven model, mirroring the Raft engine's shape:
//!
//! ```text
//! Protocol messages → PbftState::handle_message() → Vec<PbftAction>
//! ```
//!
//! The engine totally orders a stream of opaque JSON requests through the
//! classic three-phase protocol (PRE_PREPARE → PREPARE → COMMIT) and applies
//! them in strict sequence order, tolerating up to `f = ⌊(n−1)/3⌋` Byzantine
//! replicas when `n ≥ 3f + 1`. For `n < 4` the formula collapses to `f = 0`,
//! `quorum = 1`; the engine still runs, but only demonstrates protocol flow.
//!
//! Messages carry a keyed integrity tag rather than signatures; misbehaving
//! peers accumulate suspicion and are isolated once they cross a threshold.
//! The view is fixed: there is no view-change protocol. A primary timeout is
//! surfaced through [`PbftStatus::primary_suspected`] for external,
//! test-driven view advancement via [`PbftState::advance_view`].

mod message;
mod state;

pub use message::{PbftMessage, PbftMessageKind};
pub use state::{PbftAction, PbftReceipt, PbftState, PbftStatus, SubmitError, SUSPICION_THRESHOLD};
