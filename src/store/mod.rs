/// Coordination store abstraction
///
/// The engine only talks to the shared store through this narrow trait:
/// counters, FIFO lists, hashes, sets, TTL'd exclusive markers and
/// publish/subscribe channels. Redis backs it in production, the
/// in-memory implementation backs tests and single-process embedders.

pub mod memory;
pub mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use crate::error::HookResult;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Shared handle type injected into every component
pub type SharedStore = Arc<dyn CoordinationStore>;

/// Coordination store backend trait
///
/// Keys passed to these methods are logical keys; backends apply their own
/// namespace prefix.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Atomically increment a counter and return the new value
    async fn incr(&self, key: &str) -> HookResult<i64>;

    /// Append a value to the tail of a list
    async fn push(&self, key: &str, value: &str) -> HookResult<()>;

    /// Put a value back at the head of a list
    async fn push_front(&self, key: &str, value: &str) -> HookResult<()>;

    /// Pop from the head of a list, waiting up to `timeout` for an item
    async fn blocking_pop(&self, key: &str, timeout: Duration) -> HookResult<Option<String>>;

    /// Number of items currently in a list
    async fn queue_len(&self, key: &str) -> HookResult<usize>;

    /// Read a hash field
    async fn hash_get(&self, key: &str, field: &str) -> HookResult<Option<String>>;

    /// Write a hash field
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> HookResult<()>;

    /// Remove a hash field
    async fn hash_delete(&self, key: &str, field: &str) -> HookResult<()>;

    /// Add members to a set
    async fn set_add(&self, key: &str, members: &[String]) -> HookResult<()>;

    /// Remove members from a set
    async fn set_remove(&self, key: &str, members: &[String]) -> HookResult<()>;

    /// All members of a set (empty when the key is absent)
    async fn set_members(&self, key: &str) -> HookResult<HashSet<String>>;

    /// Logical keys matching a glob-style pattern (only `*` is supported)
    async fn keys(&self, pattern: &str) -> HookResult<Vec<String>>;

    /// Delete a key of any type
    async fn delete(&self, key: &str) -> HookResult<()>;

    /// Check whether a key exists
    async fn exists(&self, key: &str) -> HookResult<bool>;

    /// Set `key` only if absent, with a TTL. Returns whether the caller now holds it.
    async fn acquire(&self, key: &str, value: &str, ttl: Duration) -> HookResult<bool>;

    /// Drop a marker taken with `acquire`
    async fn release(&self, key: &str) -> HookResult<()>;

    /// Publish a message on a channel
    async fn publish(&self, channel: &str, message: &str) -> HookResult<()>;

    /// Subscribe to a channel; messages arrive on the returned receiver
    async fn subscribe(&self, channel: &str) -> HookResult<mpsc::Receiver<String>>;

    /// Connectivity check
    async fn ping(&self) -> HookResult<()>;
}

/// Match a logical key against a pattern where `*` matches any run of characters
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let mut rest = key;
    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }

    true
}
