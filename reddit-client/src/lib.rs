pub mod api;
pub mod auth;
pub mod metrics;
pub mod rate_limiter;
pub mod source;


pub use api::{ListingApi, ListingPage, PageAnchor, RedditApiClient};
pub use auth::{AccessToken, CredentialProvider, PasswordGrant, TokenEndpoint, TokenProvider};
pub use metrics::{ApiMetrics, MetricsCollector};
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use source::{ContentSource, ListingBatch, RedditSource, SourceSettings};
