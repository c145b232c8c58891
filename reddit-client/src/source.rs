//! Paging "new items" source on top of the listing API.

use crate::api::{ListingApi, ListingPage, PageAnchor};
use crate::auth::TokenProvider;
use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use subredmonitor_core::config::RedditSettings;
use subredmonitor_core::retry::{calculate_delay, deadline_after, sleep_or_cancel};
use subredmonitor_core::{CandidateItem, CoreError, ErrorExt, PollCursor, RedditApiError, RetryConfig};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Items newer than the cursor a poll started from.
#[derive(Debug, Clone, Default)]
pub struct ListingBatch {
    /// Oldest first.
    pub items: Vec<CandidateItem>,
    /// Cursor to commit once every item has been evaluated.
    pub next_cursor: Option<PollCursor>,
    /// The backlog since the previous cursor is larger than the page
    /// limit. `items` holds its oldest part and later polls read the rest.
    pub truncated: bool,
}

#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn list_new_items(
        &self,
        subreddit: &str,
        after: Option<&PollCursor>,
        cancel: &CancellationToken,
    ) -> Result<ListingBatch, CoreError>;
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub page_size: u32,
    pub page_limit: u32,
    pub cycle_budget: Duration,
    pub backoff: RetryConfig,
}

impl From<&RedditSettings> for SourceSettings {
    fn from(settings: &RedditSettings) -> Self {
        Self {
            page_size: settings.page_size,
            page_limit: settings.page_limit,
            cycle_budget: settings.cycle_budget,
            backoff: settings.backoff.clone(),
        }
    }
}

pub struct RedditSource<A, T> {
    api: A,
    tokens: T,
    settings: SourceSettings,
}

impl<A: ListingApi, T: TokenProvider> RedditSource<A, T> {
    pub fn new(api: A, tokens: T, settings: SourceSettings) -> Self {
        Self {
            api,
            tokens,
            settings,
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Fetch one page, absorbing rate limits, a single token rejection and
    /// transient failures until `deadline`.
    async fn fetch_page(
        &self,
        subreddit: &str,
        anchor: Option<PageAnchor<'_>>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<ListingPage, CoreError> {
        let mut auth_retried = false;
        let mut transient_failures = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }

            let attempt = async {
                match self.tokens.access_token().await {
                    Ok(token) => {
                        let result = self
                            .api
                            .fetch_new_page(&token, subreddit, self.settings.page_size, anchor)
                            .await;
                        (Some(token), result)
                    }
                    Err(e) => (None, Err(e)),
                }
            };
            let (token, result) = tokio::select! {
                _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                outcome = attempt => outcome,
            };

            let error = match result {
                Ok(page) => return Ok(page),
                Err(error) => error,
            };

            match &error {
                CoreError::RedditApi(RedditApiError::InvalidToken) => {
                    if auth_retried {
                        warn!("Token rejected again after refresh for r/{}", subreddit);
                        return Err(CoreError::RedditApi(RedditApiError::AuthenticationFailed {
                            reason: "access token rejected after refresh".to_string(),
                        }));
                    }
                    auth_retried = true;
                    info!("Access token rejected for r/{}, refreshing", subreddit);
                    if let Some(token) = token {
                        self.tokens.invalidate(&token).await;
                    }
                }
                CoreError::RedditApi(RedditApiError::RateLimitExceeded { retry_after }) => {
                    let wait = Duration::from_secs(*retry_after);
                    warn!(
                        "Rate limited while listing r/{}, suspending for {:?}",
                        subreddit, wait
                    );
                    sleep_or_cancel(wait, cancel).await?;
                }
                e if e.is_retryable() => {
                    let delay = calculate_delay(transient_failures, &self.settings.backoff);
                    transient_failures = transient_failures.saturating_add(1);
                    // Bounded by the cycle budget only.
                    if deadline_after(Instant::now(), delay) > deadline {
                        warn!(
                            "Giving up on r/{} this cycle after {} failures: {}",
                            subreddit, transient_failures, e
                        );
                        return Err(CoreError::Timeout {
                            seconds: self.settings.cycle_budget.as_secs(),
                        });
                    }
                    e.log_warn();
                    debug!("Retrying r/{} listing in {:?}", subreddit, delay);
                    sleep_or_cancel(delay, cancel).await?;
                }
                _ => return Err(error),
            }
        }
    }

    /// Read forward from `cursor` with `before=`, at most `max_pages`
    /// pages. Returns the posts found and whether the newest end of the
    /// listing was reached.
    async fn catch_up(
        &self,
        subreddit: &str,
        cursor: &PollCursor,
        max_pages: u32,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(Vec<CandidateItem>, bool), CoreError> {
        let mut backlog = Vec::new();
        let mut seen_ids = HashSet::new();
        let mut anchor = cursor.id.clone();

        for _ in 0..max_pages {
            let page = self
                .fetch_page(subreddit, Some(PageAnchor::Before(&anchor)), deadline, cancel)
                .await?;
            let full = page.items.len() >= self.settings.page_size as usize;
            let newest = page
                .items
                .iter()
                .max_by_key(|item| item.cursor())
                .map(|item| item.id.clone());

            for item in page.items {
                if !cursor.covers(&item) && seen_ids.insert(item.id.clone()) {
                    backlog.push(item);
                }
            }

            match newest {
                Some(id) if full => anchor = id,
                _ => return Ok((backlog, true)),
            }
        }
        Ok((backlog, false))
    }
}

#[async_trait]
impl<A: ListingApi, T: TokenProvider> ContentSource for RedditSource<A, T> {
    async fn list_new_items(
        &self,
        subreddit: &str,
        after: Option<&PollCursor>,
        cancel: &CancellationToken,
    ) -> Result<ListingBatch, CoreError> {
        let deadline = deadline_after(Instant::now(), self.settings.cycle_budget);
        let max_pages = if after.is_some() {
            self.settings.page_limit.max(1)
        } else {
            1
        };

        let mut collected: Vec<CandidateItem> = Vec::new();
        let mut seen_ids = HashSet::new();
        let mut page_token: Option<String> = None;
        let mut reached_cursor = false;
        let mut exhausted = false;
        let mut pages = 0;

        while pages < max_pages {
            let page = self
                .fetch_page(
                    subreddit,
                    page_token.as_deref().map(PageAnchor::After),
                    deadline,
                    cancel,
                )
                .await?;
            pages += 1;

            for item in page.items {
                if after.map(|cursor| cursor.covers(&item)).unwrap_or(false) {
                    reached_cursor = true;
                    continue;
                }
                if seen_ids.insert(item.id.clone()) {
                    collected.push(item);
                }
            }

            if reached_cursor {
                break;
            }
            match page.after {
                Some(next) => page_token = Some(next),
                None => {
                    exhausted = true;
                    break;
                }
            }
        }

        let mut truncated = false;
        if let Some(cursor) = after.filter(|_| !reached_cursor && !exhausted) {
            let (backlog, reached_front) = self
                .catch_up(subreddit, cursor, max_pages, deadline, cancel)
                .await?;
            if backlog.is_empty() {
                // The cursor post is gone from the listing, so there is
                // nothing to page forward from.
                warn!(
                    "r/{}: {} is no longer listed and the backlog exceeds {} page(s), older posts skipped",
                    subreddit, cursor, max_pages
                );
            } else if reached_front {
                for item in backlog {
                    if seen_ids.insert(item.id.clone()) {
                        collected.push(item);
                    }
                }
            } else {
                info!(
                    "r/{}: backlog exceeds {} page(s), catching up from {}",
                    subreddit, max_pages, cursor
                );
                collected = backlog;
                truncated = true;
            }
        }

        collected.sort_by_key(CandidateItem::cursor);
        let next_cursor = collected
            .last()
            .map(CandidateItem::cursor)
            .or_else(|| after.cloned());

        debug!(
            "r/{}: {} new posts over {} page(s)",
            subreddit,
            collected.len(),
            pages
        );

        Ok(ListingBatch {
            items: collected,
            next_cursor,
            truncated,
        })
    }
}
