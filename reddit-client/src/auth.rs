//! Access-token management for the Reddit script-app password grant.

use async_trait::async_trait;
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, ClientId, ClientSecret, HttpRequest, HttpResponse, RequestTokenError,
    ResourceOwnerPassword, ResourceOwnerUsername, TokenResponse, TokenUrl,
};
use reqwest::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use subredmonitor_core::{CoreError, RedditApiError, RedditCredentials};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const REDDIT_AUTHORIZE_URL: &str = "https://www.reddit.com/api/v1/authorize";
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// Refresh this long before the reported expiry.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// A bearer token tagged with the refresh generation that produced it.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub value: String,
    pub generation: u64,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Token freshly issued by the authorization server.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub access_token: String,
    pub expires_in: Duration,
}

/// Performs the actual token exchange.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn request_token(&self) -> Result<IssuedToken, CoreError>;
}

/// Hands out valid access tokens to concurrent callers.
///
/// Implementations must allow at most one refresh in flight.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<AccessToken, CoreError>;

    /// Drop `token` so the next call refreshes. A no-op when a newer token
    /// has already replaced it.
    async fn invalidate(&self, token: &AccessToken);
}

#[async_trait]
impl<P: TokenProvider + ?Sized> TokenProvider for std::sync::Arc<P> {
    async fn access_token(&self) -> Result<AccessToken, CoreError> {
        (**self).access_token().await
    }

    async fn invalidate(&self, token: &AccessToken) {
        (**self).invalidate(token).await
    }
}

#[derive(Debug)]
struct CachedToken {
    token: AccessToken,
    expires_at: Instant,
}

/// Caching credential provider. The async mutex is held across the token
/// exchange, so concurrent callers wait for one refresh instead of racing.
pub struct CredentialProvider<E> {
    endpoint: E,
    cached: Mutex<Option<CachedToken>>,
    generation: AtomicU64,
}

impl<E: TokenEndpoint> CredentialProvider<E> {
    pub fn new(endpoint: E) -> Self {
        Self {
            endpoint,
            cached: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Number of successful refreshes so far.
    pub fn refresh_count(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<E: TokenEndpoint> TokenProvider for CredentialProvider<E> {
    async fn access_token(&self) -> Result<AccessToken, CoreError> {
        let mut cached = self.cached.lock().await;

        if let Some(current) = cached.as_ref() {
            if current.expires_at > Instant::now() + REFRESH_MARGIN {
                return Ok(current.token.clone());
            }
            debug!("Access token near expiry, refreshing");
        }

        let issued = self.endpoint.request_token().await?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = AccessToken {
            value: issued.access_token,
            generation,
        };
        *cached = Some(CachedToken {
            token: token.clone(),
            expires_at: Instant::now() + issued.expires_in,
        });

        info!(
            "Obtained Reddit access token (generation {}, expires in {:?})",
            generation, issued.expires_in
        );
        Ok(token)
    }

    async fn invalidate(&self, token: &AccessToken) {
        let mut cached = self.cached.lock().await;
        if cached
            .as_ref()
            .map(|c| c.token.generation == token.generation)
            .unwrap_or(false)
        {
            warn!("Invalidating Reddit access token generation {}", token.generation);
            *cached = None;
        }
    }
}

/// OAuth2 resource-owner password grant against Reddit's token endpoint.
pub struct PasswordGrant {
    oauth: BasicClient,
    http: Client,
    username: ResourceOwnerUsername,
    password: ResourceOwnerPassword,
}

impl PasswordGrant {
    pub fn new(
        credentials: &RedditCredentials,
        token_url: &str,
        user_agent: &str,
    ) -> Result<Self, CoreError> {
        let auth_url = AuthUrl::new(REDDIT_AUTHORIZE_URL.to_string()).map_err(|e| {
            CoreError::Internal {
                message: format!("invalid authorize URL: {}", e),
            }
        })?;
        let token_url = TokenUrl::new(token_url.to_string()).map_err(|e| CoreError::Internal {
            message: format!("invalid token URL {}: {}", token_url, e),
        })?;

        let oauth = BasicClient::new(
            ClientId::new(credentials.client_id.clone()),
            Some(ClientSecret::new(
                credentials.client_secret.expose().to_string(),
            )),
            auth_url,
            Some(token_url),
        );

        let http = Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            oauth,
            http,
            username: ResourceOwnerUsername::new(credentials.username.clone()),
            password: ResourceOwnerPassword::new(credentials.password.expose().to_string()),
        })
    }
}

async fn send_token_request(
    http: Client,
    request: HttpRequest,
) -> Result<HttpResponse, reqwest::Error> {
    let response = http
        .request(request.method, request.url.as_str())
        .headers(request.headers)
        .body(request.body)
        .send()
        .await?;

    let status_code = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await?.to_vec();

    Ok(HttpResponse {
        status_code,
        headers,
        body,
    })
}

#[async_trait]
impl TokenEndpoint for PasswordGrant {
    async fn request_token(&self) -> Result<IssuedToken, CoreError> {
        let http = self.http.clone();
        let response = self
            .oauth
            .exchange_password(&self.username, &self.password)
            .request_async(move |request| send_token_request(http, request))
            .await
            .map_err(|e| match e {
                RequestTokenError::ServerResponse(response) => {
                    CoreError::RedditApi(RedditApiError::AuthenticationFailed {
                        reason: response.error().to_string(),
                    })
                }
                RequestTokenError::Request(e) => CoreError::Network(e),
                // Reddit answers bad credentials with 200 and {"error": ...}
                RequestTokenError::Parse(e, _) => {
                    CoreError::RedditApi(RedditApiError::AuthenticationFailed {
                        reason: format!("unexpected token response: {}", e),
                    })
                }
                RequestTokenError::Other(reason) => {
                    CoreError::RedditApi(RedditApiError::AuthenticationFailed { reason })
                }
            })?;

        Ok(IssuedToken {
            access_token: response.access_token().secret().clone(),
            expires_in: response.expires_in().unwrap_or(DEFAULT_TOKEN_LIFETIME),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    struct CountingEndpoint {
        calls: AtomicU32,
        lifetime: Duration,
    }

    #[async_trait]
    impl TokenEndpoint for CountingEndpoint {
        async fn request_token(&self) -> Result<IssuedToken, CoreError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(IssuedToken {
                access_token: format!("token-{}", n),
                expires_in: self.lifetime,
            })
        }
    }

    fn provider(lifetime: Duration) -> Arc<CredentialProvider<CountingEndpoint>> {
        Arc::new(CredentialProvider::new(CountingEndpoint {
            calls: AtomicU32::new(0),
            lifetime,
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_is_cached() {
        let provider = provider(Duration::from_secs(3600));
        let first = provider.access_token().await.unwrap();
        let second = provider.access_token().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.refresh_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_refresh() {
        let provider = provider(Duration::from_secs(3600));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let provider = provider.clone();
            handles.push(tokio::spawn(async move {
                provider.access_token().await.unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().value, "token-1");
        }
        assert_eq!(provider.endpoint.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refreshes_before_expiry() {
        let provider = provider(Duration::from_secs(120));
        let first = provider.access_token().await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(provider.access_token().await.unwrap(), first);

        // Inside the refresh margin
        tokio::time::advance(Duration::from_secs(40)).await;
        let refreshed = provider.access_token().await.unwrap();
        assert_ne!(refreshed, first);
        assert_eq!(refreshed.generation, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_refresh() {
        let provider = provider(Duration::from_secs(3600));
        let first = provider.access_token().await.unwrap();
        provider.invalidate(&first).await;
        let second = provider.access_token().await.unwrap();
        assert_eq!(second.value, "token-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_invalidate_keeps_newer_token() {
        let provider = provider(Duration::from_secs(3600));
        let first = provider.access_token().await.unwrap();
        provider.invalidate(&first).await;
        let second = provider.access_token().await.unwrap();

        // A slow caller reporting the old token must not discard the new one.
        provider.invalidate(&first).await;
        assert_eq!(provider.access_token().await.unwrap(), second);
        assert_eq!(provider.refresh_count(), 2);
    }

    #[test]
    fn test_access_token_debug_hides_value() {
        let token = AccessToken {
            value: "super-secret".to_string(),
            generation: 3,
        };
        let printed = format!("{:?}", token);
        assert!(!printed.contains("super-secret"));
        assert!(printed.contains('3'));
    }

    #[test]
    fn test_password_grant_construction() {
        let credentials = RedditCredentials {
            client_id: "id".to_string(),
            client_secret: subredmonitor_core::Secret::new("secret"),
            username: "bot".to_string(),
            password: subredmonitor_core::Secret::new("pw"),
        };
        assert!(PasswordGrant::new(
            &credentials,
            "https://www.reddit.com/api/v1/access_token",
            "subredmonitor v0.1"
        )
        .is_ok());
        assert!(PasswordGrant::new(&credentials, "not a url", "subredmonitor v0.1").is_err());
    }
}
