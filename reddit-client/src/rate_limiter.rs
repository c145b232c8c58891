use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, warn};

/// Longest wait a server header can impose.
pub const MAX_SERVER_WAIT: Duration = Duration::from_secs(15 * 60);

/// Turn a header value in seconds into a wait, clamped to
/// `0..=MAX_SERVER_WAIT`. `NaN` counts as zero.
pub fn header_wait(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0))
        .unwrap_or(MAX_SERVER_WAIT)
        .min(MAX_SERVER_WAIT)
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub time_window: Duration,
    pub burst_allowance: u32,
}

impl RateLimitConfig {
    pub fn reddit_oauth() -> Self {
        Self {
            max_requests: 100, // Reddit allows 100 requests per minute for OAuth2
            time_window: Duration::from_secs(60), // 1 minute window
            burst_allowance: 10, // Allow small bursts up to 10 requests
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    capacity: f64,
    refill_rate: f64, // tokens per second
}

impl TokenBucket {
    pub fn new(config: &RateLimitConfig) -> Self {
        let capacity = config.burst_allowance as f64;
        let refill_rate = config.max_requests as f64 / config.time_window.as_secs_f64();

        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            capacity,
            refill_rate,
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        state.last_refill = now;
    }

    /// Take `tokens_needed` tokens, or report how long until they exist.
    pub async fn acquire(&self, tokens_needed: f64) -> Result<(), Duration> {
        let mut state = self.state.lock().await;
        self.refill(&mut state);

        if state.tokens >= tokens_needed {
            state.tokens -= tokens_needed;
            Ok(())
        } else {
            let missing = tokens_needed - state.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_rate))
        }
    }

    pub async fn get_available_tokens(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.tokens
    }
}

/// Budget reported by the server through `X-Ratelimit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServerRateLimit {
    pub remaining: f64,
    pub reset_after: Duration,
}

/// Client-side pacing plus the server-reported window.
///
/// When the server says the budget is spent (or answers 429), every caller
/// sharing this limiter is held until the window resets. Requests are
/// delayed, never dropped.
#[derive(Debug)]
pub struct RateLimiter {
    token_bucket: TokenBucket,
    semaphore: Semaphore,
    config: RateLimitConfig,
    suspended_until: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            token_bucket: TokenBucket::new(&config),
            semaphore: Semaphore::new(config.burst_allowance.max(1) as usize),
            config,
            suspended_until: Mutex::new(None),
        }
    }

    pub async fn acquire_permit(&self) -> RateLimitPermit<'_> {
        let start_time = Instant::now();
        // The semaphore is never closed.
        let permit = self.semaphore.acquire().await.ok();

        if let Some(deadline) = self.suspension_deadline().await {
            debug!(
                "Server rate limit window active, waiting {:?}",
                deadline.saturating_duration_since(Instant::now())
            );
            sleep_until(deadline).await;
        }

        loop {
            match self.token_bucket.acquire(1.0).await {
                Ok(()) => break,
                Err(wait_time) => {
                    debug!("Rate limit reached, waiting {:?}", wait_time);
                    sleep(wait_time).await;
                }
            }
        }

        RateLimitPermit {
            _permit: permit,
            queue_wait_time: start_time.elapsed(),
        }
    }

    async fn suspension_deadline(&self) -> Option<Instant> {
        let mut suspended = self.suspended_until.lock().await;
        match *suspended {
            Some(deadline) if deadline > Instant::now() => Some(deadline),
            Some(_) => {
                *suspended = None;
                None
            }
            None => None,
        }
    }

    /// Hold every caller until `delay` from now. Never shortens an existing
    /// suspension.
    pub async fn suspend_for(&self, delay: Duration) {
        let delay = delay.min(MAX_SERVER_WAIT);
        let deadline = Instant::now() + delay;
        let mut suspended = self.suspended_until.lock().await;
        if suspended.map(|current| deadline > current).unwrap_or(true) {
            warn!("Suspending Reddit requests for {:?}", delay);
            *suspended = Some(deadline);
        }
    }

    /// Feed the server-reported budget back into the limiter.
    pub async fn observe(&self, server: ServerRateLimit) {
        if server.remaining < 1.0 {
            self.suspend_for(server.reset_after).await;
        }
    }

    pub async fn get_rate_limit_status(&self) -> RateLimitStatus {
        let available_tokens = self.token_bucket.get_available_tokens().await;
        let suspended_for = self
            .suspension_deadline()
            .await
            .map(|d| d.saturating_duration_since(Instant::now()));

        RateLimitStatus {
            available_tokens: available_tokens as u32,
            max_tokens: self.config.burst_allowance,
            available_permits: self.semaphore.available_permits(),
            requests_per_minute: self.config.max_requests,
            suspended_for,
        }
    }
}

#[derive(Debug)]
pub struct RateLimitPermit<'a> {
    _permit: Option<tokio::sync::SemaphorePermit<'a>>,
    pub queue_wait_time: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimitStatus {
    pub available_tokens: u32,
    pub max_tokens: u32,
    pub available_permits: usize,
    pub requests_per_minute: u32,
    pub suspended_for: Option<Duration>,
}

impl RateLimitStatus {
    pub fn utilization_percentage(&self) -> f64 {
        let used_tokens = self.max_tokens.saturating_sub(self.available_tokens);
        (used_tokens as f64 / self.max_tokens.max(1) as f64) * 100.0
    }

    pub fn is_near_limit(&self) -> bool {
        self.suspended_for.is_some() || self.utilization_percentage() > 80.0
    }
}

/// Parse Reddit's `X-Ratelimit-Remaining` / `X-Ratelimit-Reset` headers.
pub fn parse_rate_limit_headers(headers: &reqwest::header::HeaderMap) -> Option<ServerRateLimit> {
    let read = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
    };
    let remaining = read("x-ratelimit-remaining")?;
    let reset = read("x-ratelimit-reset").unwrap_or(60.0);
    Some(ServerRateLimit {
        remaining,
        reset_after: header_wait(reset),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_basic() {
        let config = RateLimitConfig {
            max_requests: 10,
            time_window: Duration::from_secs(10),
            burst_allowance: 5,
        };

        let bucket = TokenBucket::new(&config);

        // Should be able to acquire up to burst allowance
        for _ in 0..5 {
            assert!(bucket.acquire(1.0).await.is_ok());
        }

        // Next acquisition should fail
        assert!(bucket.acquire(1.0).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_refill() {
        let config = RateLimitConfig {
            max_requests: 60, // 1 token per second
            time_window: Duration::from_secs(60),
            burst_allowance: 2,
        };

        let bucket = TokenBucket::new(&config);

        // Use all tokens
        assert!(bucket.acquire(2.0).await.is_ok());
        assert!(bucket.acquire(1.0).await.is_err());

        tokio::time::advance(Duration::from_millis(1100)).await;

        // Should be able to acquire one token now
        assert!(bucket.acquire(1.0).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_permits() {
        let limiter = RateLimiter::new(RateLimitConfig::reddit_oauth());

        let permit = limiter.acquire_permit().await;
        assert!(permit.queue_wait_time >= Duration::from_secs(0));
        drop(permit);

        let status = limiter.get_rate_limit_status().await;
        assert!(status.available_tokens < status.max_tokens);
        assert_eq!(status.requests_per_minute, 100);
        assert!(status.suspended_for.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspension_holds_callers_until_reset() {
        let limiter = RateLimiter::new(RateLimitConfig::reddit_oauth());
        limiter.suspend_for(Duration::from_secs(30)).await;

        let status = limiter.get_rate_limit_status().await;
        assert!(status.is_near_limit());

        let start = Instant::now();
        let _permit = limiter.acquire_permit().await;
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspension_is_never_shortened() {
        let limiter = RateLimiter::new(RateLimitConfig::reddit_oauth());
        limiter.suspend_for(Duration::from_secs(60)).await;
        limiter.suspend_for(Duration::from_secs(5)).await;

        let status = limiter.get_rate_limit_status().await;
        assert!(status.suspended_for.unwrap() > Duration::from_secs(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_observe_spent_budget_suspends() {
        let limiter = RateLimiter::new(RateLimitConfig::reddit_oauth());
        limiter
            .observe(ServerRateLimit {
                remaining: 12.0,
                reset_after: Duration::from_secs(40),
            })
            .await;
        assert!(limiter.get_rate_limit_status().await.suspended_for.is_none());

        limiter
            .observe(ServerRateLimit {
                remaining: 0.0,
                reset_after: Duration::from_secs(40),
            })
            .await;
        assert!(limiter.get_rate_limit_status().await.suspended_for.is_some());
    }

    #[test]
    fn test_parse_rate_limit_headers() {
        let mut headers = HeaderMap::new();
        assert!(parse_rate_limit_headers(&headers).is_none());

        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("598.0"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("417"));
        headers.insert("x-ratelimit-used", HeaderValue::from_static("2"));

        let parsed = parse_rate_limit_headers(&headers).unwrap();
        assert_eq!(parsed.remaining, 598.0);
        assert_eq!(parsed.reset_after, Duration::from_secs(417));
    }

    #[test]
    fn test_unreasonable_reset_headers_are_clamped() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));

        headers.insert("x-ratelimit-reset", HeaderValue::from_static("inf"));
        assert_eq!(parse_rate_limit_headers(&headers).unwrap().reset_after, MAX_SERVER_WAIT);

        headers.insert("x-ratelimit-reset", HeaderValue::from_static("1e300"));
        assert_eq!(parse_rate_limit_headers(&headers).unwrap().reset_after, MAX_SERVER_WAIT);

        headers.insert("x-ratelimit-reset", HeaderValue::from_static("-5"));
        assert_eq!(parse_rate_limit_headers(&headers).unwrap().reset_after, Duration::ZERO);

        headers.insert("x-ratelimit-reset", HeaderValue::from_static("NaN"));
        assert_eq!(parse_rate_limit_headers(&headers).unwrap().reset_after, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspension_is_capped() {
        let limiter = RateLimiter::new(RateLimitConfig::reddit_oauth());
        limiter.suspend_for(Duration::MAX).await;

        let status = limiter.get_rate_limit_status().await;
        assert!(status.suspended_for.unwrap() <= MAX_SERVER_WAIT);
    }
}
