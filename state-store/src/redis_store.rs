use crate::{cursor_key, StateStore};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::future::Future;
use std::time::Duration;
use subredmonitor_core::{
    CoreError, DedupKey, ErrorExt, PollCursor, RetryConfig, RetryExecutor, StoreError,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Redis-backed store. Dedup marks use `SET NX EX`, cursors are JSON
/// values without expiry.
#[derive(Clone)]
pub struct RedisStateStore {
    connection: ConnectionManager,
    key_prefix: String,
    retry: RetryExecutor,
    // Store retries are short and always run to completion.
    retry_guard: CancellationToken,
}

impl RedisStateStore {
    pub async fn connect(url: &str, key_prefix: &str) -> Result<Self, CoreError> {
        let client = redis::Client::open(url).map_err(StoreError::from)?;
        let connection = ConnectionManager::new(client).await.map_err(|e| {
            CoreError::Store(StoreError::Unavailable {
                reason: format!("cannot connect to {}: {}", redact_url(url), e),
            })
        })?;
        info!("Connected to Redis at {}", redact_url(url));

        Ok(Self {
            connection,
            key_prefix: key_prefix.to_string(),
            retry: RetryExecutor::new(RetryConfig::store_local()),
            retry_guard: CancellationToken::new(),
        })
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, op: F) -> Result<T, CoreError>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: Future<Output = Result<T, redis::RedisError>>,
    {
        let outcome = self
            .retry
            .execute(operation, &self.retry_guard, || {
                let fut = op(self.connection.clone());
                async move { fut.await.map_err(|e| CoreError::Store(StoreError::from(e))) }
            })
            .await;

        match outcome.result {
            Ok(value) => Ok(value),
            Err(e) if e.is_retryable() => {
                warn!("Redis {} failed after {} attempts: {}", operation, outcome.attempts, e);
                Err(CoreError::Store(StoreError::Unavailable {
                    reason: e.to_string(),
                }))
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn mark_seen_if_new(&self, key: &DedupKey, ttl: Duration) -> Result<bool, CoreError> {
        let ttl_secs = ttl.as_secs().max(1);
        let created: Option<String> = self
            .with_retry("SET NX", |mut conn| {
                let key = key.as_str().to_string();
                async move {
                    redis::cmd("SET")
                        .arg(key)
                        .arg(1)
                        .arg("NX")
                        .arg("EX")
                        .arg(ttl_secs)
                        .query_async(&mut conn)
                        .await
                }
            })
            .await?;

        debug!("Dedup mark {} new={}", key, created.is_some());
        Ok(created.is_some())
    }

    async fn is_seen(&self, key: &DedupKey) -> Result<bool, CoreError> {
        self.with_retry("EXISTS", |mut conn| {
            let key = key.as_str().to_string();
            async move { redis::cmd("EXISTS").arg(key).query_async(&mut conn).await }
        })
        .await
    }

    async fn load_cursor(&self, target: &str) -> Result<Option<PollCursor>, CoreError> {
        let key = cursor_key(&self.key_prefix, target);
        let raw: Option<String> = self
            .with_retry("GET", |mut conn| {
                let key = key.clone();
                async move { redis::cmd("GET").arg(key).query_async(&mut conn).await }
            })
            .await?;

        match raw {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| {
                CoreError::Store(StoreError::CorruptValue {
                    key,
                    reason: e.to_string(),
                })
            }),
        }
    }

    async fn save_cursor(&self, target: &str, cursor: &PollCursor) -> Result<(), CoreError> {
        let key = cursor_key(&self.key_prefix, target);
        let value = serde_json::to_string(cursor)?;
        self.with_retry("SET", |mut conn| {
            let key = key.clone();
            let value = value.clone();
            async move { redis::cmd("SET").arg(key).arg(value).query_async(&mut conn).await }
        })
        .await
    }

    async fn ping(&self) -> Result<(), CoreError> {
        let reply: String = self
            .with_retry("PING", |mut conn| async move {
                redis::cmd("PING").query_async(&mut conn).await
            })
            .await?;
        debug!("Redis answered {}", reply);
        Ok(())
    }
}

/// Hide any password embedded in a connection URL.
fn redact_url(url: &str) -> String {
    match url.split_once('@') {
        Some((scheme_and_auth, host)) => {
            let scheme = scheme_and_auth
                .split_once("://")
                .map(|(scheme, _)| scheme)
                .unwrap_or("redis");
            format!("{}://***@{}", scheme, host)
        }
        None => url.to_string(),
    }
}
