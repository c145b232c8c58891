#[cfg(test)]
mod tests {
    use crate::{cursor_key, InMemoryStateStore, StateStore};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use std::time::Duration;
    use subredmonitor_core::{DedupKey, PollCursor};

    const TTL: Duration = Duration::from_secs(7 * 24 * 3600);

    fn cursor(id: &str, secs: i64) -> PollCursor {
        PollCursor {
            created_utc: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_mark_seen_only_once() {
        let store = InMemoryStateStore::new();
        let key = DedupKey::new("subredmonitor", "rust", "t3_abc");

        assert!(!store.is_seen(&key).await.unwrap());
        assert!(store.mark_seen_if_new(&key, TTL).await.unwrap());
        assert!(!store.mark_seen_if_new(&key, TTL).await.unwrap());
        assert!(store.is_seen(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_are_scoped_per_target() {
        let store = InMemoryStateStore::new();
        let rust = DedupKey::new("subredmonitor", "rust", "t3_abc");
        let deals = DedupKey::new("subredmonitor", "deals", "t3_abc");

        assert!(store.mark_seen_if_new(&rust, TTL).await.unwrap());
        assert!(store.mark_seen_if_new(&deals, TTL).await.unwrap());
        assert_eq!(store.seen_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_marks_expire_after_ttl() {
        let store = InMemoryStateStore::new();
        let key = DedupKey::new("subredmonitor", "rust", "t3_abc");

        assert!(store
            .mark_seen_if_new(&key, Duration::from_secs(60))
            .await
            .unwrap());
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!store
            .mark_seen_if_new(&key, Duration::from_secs(60))
            .await
            .unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!store.is_seen(&key).await.unwrap());
        assert!(store
            .mark_seen_if_new(&key, Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_marks_have_single_winner() {
        let store = Arc::new(InMemoryStateStore::new());
        let key = DedupKey::new("subredmonitor", "rust", "t3_race");

        let attempts = (0..16).map(|_| {
            let store = store.clone();
            let key = key.clone();
            async move { store.mark_seen_if_new(&key, TTL).await.unwrap() }
        });
        let results = futures::future::join_all(attempts).await;

        assert_eq!(results.iter().filter(|created| **created).count(), 1);
    }

    #[tokio::test]
    async fn test_cursor_round_trip() {
        let store = InMemoryStateStore::new();
        assert!(store.load_cursor("rust").await.unwrap().is_none());

        store.save_cursor("rust", &cursor("t3_a", 10)).await.unwrap();
        store.save_cursor("rust", &cursor("t3_b", 20)).await.unwrap();

        assert_eq!(
            store.load_cursor("rust").await.unwrap(),
            Some(cursor("t3_b", 20))
        );
        assert!(store.load_cursor("deals").await.unwrap().is_none());
        assert!(store.ping().await.is_ok());
    }

    #[test]
    fn test_cursor_key_layout() {
        assert_eq!(cursor_key("subredmonitor", "rust"), "subredmonitor:cursor:rust");
        assert_ne!(
            cursor_key("subredmonitor", "rust"),
            DedupKey::new("subredmonitor", "rust", "t3_abc").as_str()
        );
    }

    #[test]
    fn test_cursor_serializes_as_json() {
        let original = cursor("t3_abc", 5);
        let raw = serde_json::to_string(&original).unwrap();
        assert!(raw.contains("t3_abc"));
        let parsed: PollCursor = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, original);
    }
}
