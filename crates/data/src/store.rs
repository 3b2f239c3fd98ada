//! Capability interfaces over external storage, with Redis and in-memory
//! implementations.

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use tracing::debug;

/// Errors from the external stores. All of them are transient from the
/// caller's point of view: the data lives outside this process.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// The durable list store the queue is built on.
///
/// Required operations, each atomic on the store side:
/// - append a value at the tail of a named list
/// - move the head of one list to the tail of another, returning it
/// - remove one occurrence of a value from a list
#[async_trait]
pub trait ListStore: Send + Sync {
    /// Append `value` at the tail of `list`.
    async fn push_back(&self, list: &str, value: &str) -> Result<(), StoreError>;

    /// Atomically pop the head of `from` and push it at the tail of `to`.
    /// Returns the moved value, or `None` when `from` is empty.
    async fn move_head(&self, from: &str, to: &str) -> Result<Option<String>, StoreError>;

    /// Remove one occurrence of `value` from `list`. Returns how many
    /// elements were removed (0 or 1).
    async fn remove(&self, list: &str, value: &str) -> Result<u64, StoreError>;

    /// Read the full contents of `list`, head first.
    async fn items(&self, list: &str) -> Result<Vec<String>, StoreError>;
}

/// `ListStore` over a Redis server, the conventional deployment.
#[derive(Clone)]
pub struct RedisListStore {
    manager: redis::aio::ConnectionManager,
}

impl RedisListStore {
    /// Connect to Redis; the connection manager reconnects on failure.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let manager = redis::aio::ConnectionManager::new(client).await?;
        debug!(url, "Connected to Redis list store");
        Ok(Self { manager })
    }
}

#[async_trait]
impl ListStore for RedisListStore {
    async fn push_back(&self, list: &str, value: &str) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        let _: i64 = con.rpush(list, value).await?;
        Ok(())
    }

    async fn move_head(&self, from: &str, to: &str) -> Result<Option<String>, StoreError> {
        let mut con = self.manager.clone();
        let moved: Option<String> = con
            .lmove(from, to, redis::Direction::Left, redis::Direction::Right)
            .await?;
        Ok(moved)
    }

    async fn remove(&self, list: &str, value: &str) -> Result<u64, StoreError> {
        let mut con = self.manager.clone();
        let removed: i64 = con.lrem(list, 1, value).await?;
        Ok(removed.max(0) as u64)
    }

    async fn items(&self, list: &str) -> Result<Vec<String>, StoreError> {
        let mut con = self.manager.clone();
        let items: Vec<String> = con.lrange(list, 0, -1).await?;
        Ok(items)
    }
}

/// In-process `ListStore` for tests and single-node demos. Every operation
/// runs under one lock, giving the same atomicity the Redis commands do.
#[derive(Debug, Default)]
pub struct MemoryListStore {
    lists: Mutex<HashMap<String, VecDeque<String>>>,
}

impl MemoryListStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ListStore for MemoryListStore {
    async fn push_back(&self, list: &str, value: &str) -> Result<(), StoreError> {
        self.lists
            .lock()
            .entry(list.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn move_head(&self, from: &str, to: &str) -> Result<Option<String>, StoreError> {
        let mut lists = self.lists.lock();
        let moved = lists.get_mut(from).and_then(|l| l.pop_front());
        if let Some(value) = &moved {
            lists.entry(to.to_string()).or_default().push_back(value.clone());
        }
        Ok(moved)
    }

    async fn remove(&self, list: &str, value: &str) -> Result<u64, StoreError> {
        let mut lists = self.lists.lock();
        let Some(items) = lists.get_mut(list) else {
            return Ok(0);
        };
        match items.iter().position(|v| v == value) {
            Some(pos) => {
                items.remove(pos);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn items(&self, list: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lists
            .lock()
            .get(list)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default())
    }
}

/// The backing data source the cache falls through to on a miss.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Fetch the authoritative value for `key`, if any.
    async fn fetch(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;

    /// Write `value` through to the source, if it supports writes. Returns
    /// whether the write was stored. A cache `put` calls this between its
    /// local update and the invalidation broadcast, so peers that re-fetch
    /// after invalidation observe the new value. Read-only sources keep the
    /// default no-op.
    async fn write(&self, key: &str, value: &serde_json::Value) -> Result<bool, StoreError> {
        let _ = (key, value);
        Ok(false)
    }
}

/// A seedable in-process data source.
#[derive(Debug, Default)]
pub struct StaticDataSource {
    entries: parking_lot::RwLock<HashMap<String, serde_json::Value>>,
}

impl StaticDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with initial entries.
    pub fn with_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, serde_json::Value)>,
        K: Into<String>,
    {
        let source = Self::new();
        {
            let mut map = source.entries.write();
            for (k, v) in entries {
                map.insert(k.into(), v);
            }
        }
        source
    }

    pub fn insert(&self, key: impl Into<String>, value: serde_json::Value) {
        self.entries.write().insert(key.into(), value);
    }
}

#[async_trait]
impl DataSource for StaticDataSource {
    async fn fetch(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn write(&self, key: &str, value: &serde_json::Value) -> Result<bool, StoreError> {
        self.entries.write().insert(key.to_string(), value.clone());
        Ok(true)
    }
}
