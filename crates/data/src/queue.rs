//! Queue operations over the durable list store.
//!
//! Delivery is at-least-once: `consume` atomically moves the head of the
//! queue list into a sibling processing list, where it stays until `ack`
//! removes it. A consumer that crashes between the two leaves the message in
//! the processing list for an out-of-band reclaimer.

use crate::store::{ListStore, StoreError};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

const PROCESSING_SUFFIX: &str = ":processing";

/// A message handed to a consumer, with everything needed to ack it.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumedMessage {
    pub message: serde_json::Value,
    /// The processing list the message now sits in.
    pub processing_key: String,
    /// The exact stored payload; acking removes this value.
    pub raw: String,
}

/// The local half of the queue component: produce/consume/ack against the
/// durable store, for queues this node is responsible for. Routing and
/// forwarding live in the transport layer.
#[derive(Clone)]
pub struct QueuePartition {
    store: Arc<dyn ListStore>,
}

impl QueuePartition {
    pub fn new(store: Arc<dyn ListStore>) -> Self {
        Self { store }
    }

    /// The sibling list that holds in-flight messages for `queue`.
    pub fn processing_key(queue: &str) -> String {
        format!("{queue}{PROCESSING_SUFFIX}")
    }

    /// Recover the queue name from a processing key, for routing acks.
    pub fn queue_of_processing_key(key: &str) -> Option<&str> {
        key.strip_suffix(PROCESSING_SUFFIX).filter(|q| !q.is_empty())
    }

    /// Append a message at the tail of the queue.
    pub async fn produce(
        &self,
        queue: &str,
        message: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(message)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        self.store.push_back(queue, &payload).await?;
        debug!(queue, "Message produced");
        Ok(())
    }

    /// Atomically move the head of the queue into its processing list and
    /// return it. `None` is the normal empty-queue outcome, not an error.
    pub async fn consume(&self, queue: &str) -> Result<Option<ConsumedMessage>, StoreError> {
        let processing_key = Self::processing_key(queue);
        let Some(raw) = self.store.move_head(queue, &processing_key).await? else {
            return Ok(None);
        };
        let message = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Unavailable(format!("corrupt queue payload: {e}")))?;
        debug!(queue, "Message consumed into processing list");
        Ok(Some(ConsumedMessage {
            message,
            processing_key,
            raw,
        }))
    }

    /// Remove an in-flight message from its processing list. Acking a
    /// message that was never consumed, or was already acked, removes
    /// nothing and is not an error.
    pub async fn ack(
        &self,
        processing_key: &str,
        message: &serde_json::Value,
    ) -> Result<bool, StoreError> {
        let payload = serde_json::to_string(message)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let removed = self.store.remove(processing_key, &payload).await?;
        debug!(processing_key, removed, "Ack processed");
        Ok(removed > 0)
    }
}
