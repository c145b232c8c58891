use crate::retry::RetryConfig;
use crate::rules::MatchRule;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

/// A post fetched from a subreddit listing. Lives for one poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateItem {
    /// Reddit fullname, e.g. `t3_abc`.
    pub id: String,
    pub subreddit: String,
    pub title: String,
    pub body: String,
    pub author: String,
    pub score: i64,
    pub flair: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub permalink: String,
    pub url: String,
    pub is_self: bool,
}

impl CandidateItem {
    pub fn cursor(&self) -> PollCursor {
        PollCursor {
            created_utc: self.created_utc,
            id: self.id.clone(),
        }
    }

    /// Title and body joined for text matching.
    pub fn searchable_text(&self) -> String {
        if self.body.is_empty() {
            self.title.clone()
        } else {
            format!("{}\n{}", self.title, self.body)
        }
    }

    pub fn permalink_url(&self) -> String {
        if self.permalink.starts_with("http") {
            self.permalink.clone()
        } else {
            format!("https://www.reddit.com{}", self.permalink)
        }
    }
}

/// Newest item already processed for a watch target.
///
/// Ordered by creation time, then by the numeric value of the base-36 id,
/// which Reddit assigns in increasing order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollCursor {
    pub created_utc: DateTime<Utc>,
    pub id: String,
}

impl PollCursor {
    fn id_rank(&self) -> u64 {
        let raw = self
            .id
            .split_once('_')
            .map(|(_, rest)| rest)
            .unwrap_or(&self.id);
        u64::from_str_radix(raw, 36).unwrap_or(0)
    }

    /// True when `item` is at or before this cursor and was handled already.
    pub fn covers(&self, item: &CandidateItem) -> bool {
        item.cursor() <= *self
    }
}

impl Ord for PollCursor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.created_utc
            .cmp(&other.created_utc)
            .then_with(|| self.id_rank().cmp(&other.id_rank()))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for PollCursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PollCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.created_utc.to_rfc3339())
    }
}

/// Store key marking an item as already alerted for one watch target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn new(prefix: &str, target: &str, item_id: &str) -> Self {
        Self(format!("{}:seen:{}:{}", prefix, target, item_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A secret read from the environment. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Prowl,
    Pushover,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Prowl => f.write_str("prowl"),
            BackendKind::Pushover => f.write_str("pushover"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendSpec {
    Prowl {
        api_key: Secret,
        priority: i8,
    },
    Pushover {
        app_token: Secret,
        user_key: Secret,
        priority: i8,
        device: Option<String>,
    },
}

impl BackendSpec {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendSpec::Prowl { .. } => BackendKind::Prowl,
            BackendSpec::Pushover { .. } => BackendKind::Pushover,
        }
    }
}

/// One configured notification destination with its own retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationTarget {
    pub name: String,
    pub backend: BackendSpec,
    pub retry: RetryConfig,
    pub verify_on_startup: bool,
}

/// One monitored subreddit (or `+`-joined multireddit) with its rules and
/// destinations. Immutable once built from configuration.
#[derive(Debug, Clone)]
pub struct WatchTarget {
    /// Stable identity used in dedup and cursor keys.
    pub name: String,
    pub subreddit: String,
    pub rules: Vec<MatchRule>,
    pub notify: Vec<String>,
    pub poll_interval: Duration,
    pub error_backoff: RetryConfig,
}

impl WatchTarget {
    pub fn dedup_key(&self, prefix: &str, item: &CandidateItem) -> DedupKey {
        DedupKey::new(prefix, &self.name, &item.id)
    }
}

/// Reddit script-app credentials.
#[derive(Debug, Clone)]
pub struct RedditCredentials {
    pub client_id: String,
    pub client_secret: Secret,
    pub username: String,
    pub password: Secret,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cursor(secs: i64, id: &str) -> PollCursor {
        PollCursor {
            created_utc: Utc.timestamp_opt(secs, 0).unwrap(),
            id: id.to_string(),
        }
    }

    #[test]
    fn test_cursor_orders_by_time_then_id() {
        assert!(cursor(100, "t3_zz") < cursor(101, "t3_a"));
        assert!(cursor(100, "t3_a9") < cursor(100, "t3_b0"));
        // base-36 rank, not lexical
        assert!(cursor(100, "t3_z") < cursor(100, "t3_10"));
    }

    #[test]
    fn test_cursor_covers_older_and_equal_items() {
        let c = cursor(1000, "t3_abc");
        let mut item = CandidateItem {
            id: "t3_abc".to_string(),
            subreddit: "test".to_string(),
            title: "t".to_string(),
            body: String::new(),
            author: "a".to_string(),
            score: 1,
            flair: None,
            created_utc: Utc.timestamp_opt(1000, 0).unwrap(),
            permalink: "/r/test/comments/abc".to_string(),
            url: String::new(),
            is_self: true,
        };
        assert!(c.covers(&item));

        item.id = "t3_abd".to_string();
        assert!(!c.covers(&item));

        item.id = "t3_abb".to_string();
        item.created_utc = Utc.timestamp_opt(999, 0).unwrap();
        assert!(c.covers(&item));
    }

    #[test]
    fn test_dedup_key_includes_target_identity() {
        let a = DedupKey::new("subredmonitor", "hardwareswap", "t3_abc");
        let b = DedupKey::new("subredmonitor", "buildapcsales", "t3_abc");
        assert_eq!(a.as_str(), "subredmonitor:seen:hardwareswap:t3_abc");
        assert_ne!(a, b);
    }

    #[test]
    fn test_secret_is_not_debug_printed() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "Secret(***)");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn test_cursor_serialization() {
        let c = cursor(1_640_995_200, "t3_abc");
        let json = serde_json::to_string(&c).unwrap();
        let back: PollCursor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }
}
