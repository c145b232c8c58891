use crate::auth::AccessToken;
use crate::metrics::{ApiMetrics, MetricsCollector, RequestMetrics};
use crate::rate_limiter::{
    header_wait, parse_rate_limit_headers, RateLimitConfig, RateLimitStatus, RateLimiter,
};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use subredmonitor_core::{CandidateItem, CoreError, RedditApiError};
use tracing::{debug, error, warn};

pub const REDDIT_API_BASE: &str = "https://oauth.reddit.com";
const DEFAULT_RATE_LIMIT_WAIT_SECS: u64 = 60;

#[derive(Debug, Clone, Deserialize)]
pub struct RedditListing<T> {
    pub kind: String,
    pub data: RedditListingData<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedditListingData<T> {
    pub children: Vec<RedditListingChild<T>>,
    pub after: Option<String>,
    pub before: Option<String>,
    pub dist: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedditListingChild<T> {
    pub kind: String,
    pub data: T,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedditPostData {
    pub id: String,
    /// Fullname (`t3_<id>`).
    #[serde(default)]
    pub name: String,
    pub title: String,
    #[serde(default)]
    pub selftext: String,
    #[serde(default)]
    pub author: String,
    pub subreddit: String,
    #[serde(default)]
    pub url: String,
    pub permalink: String,
    pub created_utc: f64,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub link_flair_text: Option<String>,
    #[serde(default)]
    pub is_self: bool,
}

impl TryFrom<RedditPostData> for CandidateItem {
    type Error = CoreError;

    fn try_from(post: RedditPostData) -> Result<Self, Self::Error> {
        let created_utc = Utc
            .timestamp_opt(post.created_utc.trunc() as i64, 0)
            .single()
            .ok_or_else(|| {
                CoreError::RedditApi(RedditApiError::InvalidResponse {
                    details: format!("post {} has invalid created_utc {}", post.id, post.created_utc),
                })
            })?;

        let id = if post.name.is_empty() {
            format!("t3_{}", post.id)
        } else {
            post.name
        };

        Ok(CandidateItem {
            id,
            subreddit: post.subreddit,
            title: post.title,
            body: post.selftext,
            author: post.author,
            score: post.score,
            flair: post.link_flair_text.filter(|f| !f.is_empty()),
            created_utc,
            permalink: post.permalink,
            url: post.url,
            is_self: post.is_self,
        })
    }
}

/// One page of a newest-first listing.
#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    /// Newest first, as the API returns them.
    pub items: Vec<CandidateItem>,
    /// Pagination token for the next (older) page.
    pub after: Option<String>,
}

/// Where a listing page starts relative to a known post fullname.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageAnchor<'a> {
    /// Posts older than the anchor.
    After(&'a str),
    /// Posts newer than the anchor, the closest ones first in line.
    Before(&'a str),
}

/// Raw access to the "new posts" listing.
#[async_trait]
pub trait ListingApi: Send + Sync {
    async fn fetch_new_page(
        &self,
        token: &AccessToken,
        subreddit: &str,
        limit: u32,
        anchor: Option<PageAnchor<'_>>,
    ) -> Result<ListingPage, CoreError>;
}

#[async_trait]
impl<L: ListingApi + ?Sized> ListingApi for Arc<L> {
    async fn fetch_new_page(
        &self,
        token: &AccessToken,
        subreddit: &str,
        limit: u32,
        anchor: Option<PageAnchor<'_>>,
    ) -> Result<ListingPage, CoreError> {
        (**self).fetch_new_page(token, subreddit, limit, anchor).await
    }
}

#[derive(Debug)]
pub struct RedditApiClient {
    http_client: Client,
    rate_limiter: Arc<RateLimiter>,
    metrics: Arc<MetricsCollector>,
    api_base: String,
    user_agent: String,
}

impl RedditApiClient {
    pub fn new(user_agent: &str, api_base: &str) -> Result<Self, CoreError> {
        let rate_limiter = Arc::new(RateLimiter::new(RateLimitConfig::reddit_oauth()));
        let metrics = Arc::new(MetricsCollector::new());

        let http_client = Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http_client,
            rate_limiter,
            metrics,
            api_base: api_base.trim_end_matches('/').to_string(),
            user_agent: user_agent.to_string(),
        })
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    pub async fn make_request(
        &self,
        method: Method,
        endpoint: &str,
        access_token: &str,
        query_params: &[(&str, &str)],
    ) -> Result<Response, CoreError> {
        let url = format!("{}{}", self.api_base, endpoint);

        let permit = self.rate_limiter.acquire_permit().await;
        debug!(
            "Acquired rate limit permit for {} {} after {:?}",
            method, endpoint, permit.queue_wait_time
        );

        let start_time = Instant::now();
        let result = self
            .http_client
            .request(method.clone(), &url)
            .bearer_auth(access_token)
            .query(query_params)
            .send()
            .await;
        drop(permit);

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                error!("Network error for {} {}: {}", method, endpoint, e);
                self.record(endpoint, None, start_time, Some("network_error"))
                    .await;
                if e.is_timeout() {
                    return Err(CoreError::RedditApi(RedditApiError::RequestTimeout));
                }
                return Err(CoreError::Network(e));
            }
        };

        let status = response.status();
        if let Some(server) = parse_rate_limit_headers(response.headers()) {
            debug!(
                "Server rate limit: {} remaining, resets in {:?}",
                server.remaining, server.reset_after
            );
            self.rate_limiter.observe(server).await;
        }

        if status.is_success() {
            debug!("Request successful: {} {}", status, endpoint);
            self.record(endpoint, Some(status), start_time, None).await;
            return Ok(response);
        }

        error!("Request failed with status: {} for {}", status, endpoint);
        let (error_type, err) = match status {
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = retry_after_secs(response.headers());
                warn!("Rate limited, retry after {} seconds", retry_after);
                self.rate_limiter
                    .suspend_for(Duration::from_secs(retry_after))
                    .await;
                ("rate_limited", RedditApiError::RateLimitExceeded { retry_after })
            }
            StatusCode::UNAUTHORIZED => ("unauthorized", RedditApiError::InvalidToken),
            StatusCode::FORBIDDEN => (
                "forbidden",
                RedditApiError::Forbidden {
                    resource: endpoint.to_string(),
                },
            ),
            StatusCode::NOT_FOUND => (
                "not_found",
                RedditApiError::SubredditNotFound {
                    subreddit: endpoint.to_string(),
                },
            ),
            s if s.is_server_error() => (
                "server_error",
                RedditApiError::ServerError {
                    status_code: s.as_u16(),
                },
            ),
            s => (
                "unexpected_status",
                RedditApiError::InvalidResponse {
                    details: format!("unexpected status {}", s),
                },
            ),
        };

        self.record(endpoint, Some(status), start_time, Some(error_type))
            .await;
        Err(CoreError::RedditApi(err))
    }

    async fn record(
        &self,
        endpoint: &str,
        status: Option<StatusCode>,
        start_time: Instant,
        error_type: Option<&str>,
    ) {
        self.metrics
            .record_request(RequestMetrics {
                endpoint: endpoint.to_string(),
                status_code: status.map(|s| s.as_u16()),
                response_time: start_time.elapsed(),
                success: error_type.is_none(),
                rate_limited: status == Some(StatusCode::TOO_MANY_REQUESTS),
                error_type: error_type.map(str::to_string),
            })
            .await;
    }

    pub async fn get_new_posts(
        &self,
        access_token: &str,
        subreddit: &str,
        limit: u32,
        anchor: Option<PageAnchor<'_>>,
    ) -> Result<RedditListing<RedditPostData>, CoreError> {
        let endpoint = format!("/r/{}/new", subreddit);
        let limit_str = limit.to_string();
        let mut params = vec![("limit", limit_str.as_str()), ("raw_json", "1")];
        match anchor {
            Some(PageAnchor::After(fullname)) => params.push(("after", fullname)),
            Some(PageAnchor::Before(fullname)) => params.push(("before", fullname)),
            None => {}
        }

        let response = self
            .make_request(Method::GET, &endpoint, access_token, &params)
            .await
            .map_err(|e| match e {
                CoreError::RedditApi(RedditApiError::SubredditNotFound { .. }) => {
                    CoreError::RedditApi(RedditApiError::SubredditNotFound {
                        subreddit: subreddit.to_string(),
                    })
                }
                other => other,
            })?;

        let listing: RedditListing<RedditPostData> = response.json().await.map_err(|e| {
            error!("Failed to parse listing for r/{}: {}", subreddit, e);
            CoreError::RedditApi(RedditApiError::InvalidResponse {
                details: format!("Failed to parse posts for r/{}", subreddit),
            })
        })?;

        debug!(
            "Retrieved {} posts from r/{}",
            listing.data.children.len(),
            subreddit
        );
        Ok(listing)
    }

    pub async fn get_metrics(&self) -> ApiMetrics {
        self.metrics.get_metrics().await
    }

    pub async fn get_rate_limit_status(&self) -> RateLimitStatus {
        self.rate_limiter.get_rate_limit_status().await
    }
}

#[async_trait]
impl ListingApi for RedditApiClient {
    async fn fetch_new_page(
        &self,
        token: &AccessToken,
        subreddit: &str,
        limit: u32,
        anchor: Option<PageAnchor<'_>>,
    ) -> Result<ListingPage, CoreError> {
        let listing = self
            .get_new_posts(&token.value, subreddit, limit, anchor)
            .await?;
        listing_to_page(listing)
    }
}

pub fn listing_to_page(listing: RedditListing<RedditPostData>) -> Result<ListingPage, CoreError> {
    let mut items = Vec::with_capacity(listing.data.children.len());
    for child in listing.data.children {
        if child.kind != "t3" {
            continue;
        }
        items.push(CandidateItem::try_from(child.data)?);
    }
    Ok(ListingPage {
        items,
        after: listing.data.after.filter(|a| !a.is_empty()),
    })
}

/// Seconds to wait after a 429: `Retry-After`, else the window reset.
fn retry_after_secs(headers: &HeaderMap) -> u64 {
    let read = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
    };
    read("retry-after")
        .or_else(|| read("x-ratelimit-reset"))
        .map(|secs| header_wait(secs.max(1.0).ceil()).as_secs())
        .unwrap_or(DEFAULT_RATE_LIMIT_WAIT_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::MAX_SERVER_WAIT;
    use reqwest::header::HeaderValue;

    const LISTING: &str = r#"{
        "kind": "Listing",
        "data": {
            "after": "t3_abd",
            "before": null,
            "dist": 2,
            "children": [
                {"kind": "t3", "data": {
                    "id": "abd", "name": "t3_abd", "title": "Newest",
                    "selftext": "", "author": "alice", "subreddit": "rust",
                    "url": "https://example.com/x", "permalink": "/r/rust/comments/abd/newest/",
                    "created_utc": 1700000100.0, "score": 3, "link_flair_text": null,
                    "is_self": false
                }},
                {"kind": "t3", "data": {
                    "id": "abc", "name": "t3_abc", "title": "Free GPU giveaway",
                    "selftext": "details inside", "author": "bob", "subreddit": "rust",
                    "url": "https://www.reddit.com/r/rust/comments/abc/",
                    "permalink": "/r/rust/comments/abc/free_gpu_giveaway/",
                    "created_utc": 1700000000.0, "score": 50, "link_flair_text": "Giveaway",
                    "is_self": true
                }}
            ]
        }
    }"#;

    #[tokio::test]
    async fn test_api_client_creation() {
        let client = RedditApiClient::new("test-user-agent/1.0", "https://oauth.reddit.com/").unwrap();
        assert_eq!(client.user_agent(), "test-user-agent/1.0");
        assert_eq!(client.api_base, "https://oauth.reddit.com");

        let status = client.get_rate_limit_status().await;
        assert!(status.available_tokens > 0);
        assert_eq!(client.get_metrics().await.total_requests, 0);
    }

    #[test]
    fn test_listing_to_page() {
        let listing: RedditListing<RedditPostData> = serde_json::from_str(LISTING).unwrap();
        let page = listing_to_page(listing).unwrap();

        assert_eq!(page.after.as_deref(), Some("t3_abd"));
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].id, "t3_abd");

        let giveaway = &page.items[1];
        assert_eq!(giveaway.id, "t3_abc");
        assert_eq!(giveaway.score, 50);
        assert_eq!(giveaway.flair.as_deref(), Some("Giveaway"));
        assert!(giveaway.is_self);
        assert_eq!(giveaway.created_utc.timestamp(), 1700000000);
        assert_eq!(
            giveaway.permalink_url(),
            "https://www.reddit.com/r/rust/comments/abc/free_gpu_giveaway/"
        );
    }

    #[test]
    fn test_post_without_fullname_gets_prefix() {
        let post = RedditPostData {
            id: "xyz".to_string(),
            name: String::new(),
            title: "t".to_string(),
            selftext: String::new(),
            author: "a".to_string(),
            subreddit: "rust".to_string(),
            url: String::new(),
            permalink: "/r/rust/comments/xyz/".to_string(),
            created_utc: 1700000000.5,
            score: 0,
            link_flair_text: Some(String::new()),
            is_self: false,
        };
        let item = CandidateItem::try_from(post).unwrap();
        assert_eq!(item.id, "t3_xyz");
        assert_eq!(item.flair, None);
    }

    #[test]
    fn test_retry_after_header_precedence() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after_secs(&headers), 60);

        headers.insert("x-ratelimit-reset", HeaderValue::from_static("42"));
        assert_eq!(retry_after_secs(&headers), 42);

        headers.insert("retry-after", HeaderValue::from_static("7"));
        assert_eq!(retry_after_secs(&headers), 7);

        headers.insert("retry-after", HeaderValue::from_static("inf"));
        assert_eq!(retry_after_secs(&headers), MAX_SERVER_WAIT.as_secs());
    }
}
