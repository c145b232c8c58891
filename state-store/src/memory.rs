use crate::StateStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use subredmonitor_core::retry::deadline_after;
use subredmonitor_core::{CoreError, DedupKey, PollCursor};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Process-local store. State does not survive a restart.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    seen: Mutex<HashMap<String, Instant>>,
    cursors: Mutex<HashMap<String, PollCursor>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live (unexpired) dedup marks.
    pub async fn seen_count(&self) -> usize {
        let now = Instant::now();
        self.seen
            .lock()
            .await
            .values()
            .filter(|expires_at| **expires_at > now)
            .count()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn mark_seen_if_new(&self, key: &DedupKey, ttl: Duration) -> Result<bool, CoreError> {
        let now = Instant::now();
        let mut seen = self.seen.lock().await;
        seen.retain(|_, expires_at| *expires_at > now);

        if seen.contains_key(key.as_str()) {
            return Ok(false);
        }
        seen.insert(key.as_str().to_string(), deadline_after(now, ttl));
        Ok(true)
    }

    async fn is_seen(&self, key: &DedupKey) -> Result<bool, CoreError> {
        let now = Instant::now();
        Ok(self
            .seen
            .lock()
            .await
            .get(key.as_str())
            .map(|expires_at| *expires_at > now)
            .unwrap_or(false))
    }

    async fn load_cursor(&self, target: &str) -> Result<Option<PollCursor>, CoreError> {
        Ok(self.cursors.lock().await.get(target).cloned())
    }

    async fn save_cursor(&self, target: &str, cursor: &PollCursor) -> Result<(), CoreError> {
        self.cursors
            .lock()
            .await
            .insert(target.to_string(), cursor.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<(), CoreError> {
        Ok(())
    }
}
