//! Persistent dedup marks and poll cursors.

pub mod memory;
pub mod redis_store;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use std::time::Duration;
use subredmonitor_core::{CoreError, DedupKey, PollCursor};

pub use memory::InMemoryStateStore;
pub use redis_store::RedisStateStore;

/// Shared by every monitor loop; implementations must be safe to call
/// concurrently for different keys.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Record `key` for `ttl`. Returns true only for the caller that
    /// created it.
    async fn mark_seen_if_new(&self, key: &DedupKey, ttl: Duration) -> Result<bool, CoreError>;

    async fn is_seen(&self, key: &DedupKey) -> Result<bool, CoreError>;

    async fn load_cursor(&self, target: &str) -> Result<Option<PollCursor>, CoreError>;

    async fn save_cursor(&self, target: &str, cursor: &PollCursor) -> Result<(), CoreError>;

    async fn ping(&self) -> Result<(), CoreError>;
}

pub fn cursor_key(prefix: &str, target: &str) -> String {
    format!("{}:cursor:{}", prefix, target)
}
