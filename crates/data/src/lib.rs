//! Durable list store, queue partition operations, and the coherent cache.
//!
//! The queue's source of truth is an external durable list store, reached
//! through the [`ListStore`] capability: append-right, atomic
//! move-head-to-sibling-list, and remove-by-value. [`RedisListStore`] is the
//! conventional production implementation; [`MemoryListStore`] backs tests
//! and single-process demos. The node owns only the routing policy (which
//! node serves which queue), not the data.
//!
//! The cache is a per-node bounded LRU whose entries carry a coherence state
//! (MODIFIED or SHARED; INVALID is represented by absence). Writers update
//! locally and broadcast invalidations; the transport layer wires that
//! broadcast, this crate owns the state machine and the metrics.

mod cache;
mod queue;
mod store;

pub use cache::{CacheState, CacheStats, CoherentCache};
pub use queue::{ConsumedMessage, QueuePartition};
pub use store::{DataSource, ListStore, MemoryListStore, RedisListStore, StaticDataSource, StoreError};
