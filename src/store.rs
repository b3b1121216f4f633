//! Durable key/value capability used for buffer overflow and agent state.
//!
//! The store itself is owned by the host (typically its Redis handler); the
//! agent only depends on this narrow capability. Running without a store is
//! fully supported — the buffer then behaves purely in-memory.
//!
//! Values are JSON strings. Key layout (all under `{key_prefix}agent:`):
//! `overflow:events:{seq}` / `overflow:metrics:{seq}` with a 7-day TTL,
//! `status:last` with a 1-hour TTL, `rules:cache` with no TTL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// TTL applied to spilled overflow entries.
pub const OVERFLOW_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// TTL applied to the persisted status snapshot.
pub const STATUS_TTL: Duration = Duration::from_secs(60 * 60);

/// Error raised by a store implementation. The agent treats every store
/// failure the same way: fall back to the memory-only path and count it.
#[derive(Debug, thiserror::Error)]
#[error("store error: {0}")]
pub struct StoreError(pub String);

/// Capability the agent expects from a durable key/value store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Stores `value` under `key`, expiring after `ttl` when given.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Fetches the value for `key`, or `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Lists all live keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Size in bytes of the value stored under `key` (0 when absent).
    async fn get_size(&self, key: &str) -> Result<usize, StoreError>;
}

/// Shared handle to a store implementation.
pub type SharedStore = Arc<dyn KvStore>;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-memory [`KvStore`] used in tests and as the reference semantics for
/// host-provided implementations.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    fn is_live(entry: &Entry) -> bool {
        entry.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|entry| Self::is_live(entry))
            .map(|entry| entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && Self::is_live(entry))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn get_size(&self, key: &str) -> Result<usize, StoreError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|entry| Self::is_live(entry))
            .map_or(0, |entry| entry.value.len()))
    }
}
