//! Foundation types for the concord coordination service.
//!
//! This crate provides the types shared by every other layer:
//!
//! - [`NodeId`]: stable node identity
//! - [`ClusterTopology`]: the ordered node set, peer derivation, the queue
//!   hash ring, and PBFT primary/quorum arithmetic
//! - [`Digest`]: SHA-256 over a canonical JSON encoding, plus the keyed
//!   message tag used to authenticate peer protocol messages
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer.

mod digest;
mod identifiers;
mod topology;

pub use digest::{message_tag, Digest, HexError};
pub use identifiers::NodeId;
pub use topology::{ClusterTopology, NodeSpec, TopologyError};
