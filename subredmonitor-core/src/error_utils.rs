use crate::error::*;
use std::time::Duration;
use tracing::{error, info, warn};

/// Coarse classification used to decide how far an error propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network trouble, rate limits, store outages: retry locally.
    Transient,
    /// Expired or rejected credentials: refresh once, then degrade the cycle.
    Auth,
    /// A single notification backend failed.
    Delivery,
    /// Bad configuration or credentials at startup.
    Configuration,
    /// Broken internal invariant: stop the affected target.
    Invariant,
    /// Shutdown in progress.
    Cancelled,
    /// Anything else; surfaced but not retried.
    Permanent,
}

pub trait ErrorExt {
    fn log_error(&self) -> &Self;
    fn log_warn(&self) -> &Self;
    fn is_retryable(&self) -> bool;
    fn retry_after(&self) -> Option<Duration>;
    fn error_code(&self) -> String;
}

impl CoreError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CoreError::RedditApi(
                RedditApiError::InvalidToken | RedditApiError::AuthenticationFailed { .. },
            ) => ErrorCategory::Auth,
            CoreError::Notify(_) => ErrorCategory::Delivery,
            CoreError::Config(_) => ErrorCategory::Configuration,
            CoreError::InvariantViolation { .. } => ErrorCategory::Invariant,
            CoreError::Cancelled => ErrorCategory::Cancelled,
            _ if self.is_retryable() => ErrorCategory::Transient,
            _ => ErrorCategory::Permanent,
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        self.category() == ErrorCategory::Auth
    }
}

impl ErrorExt for CoreError {
    fn log_error(&self) -> &Self {
        error!("CoreError: {}", self);
        match self {
            CoreError::RedditApi(e) => {
                error!("Reddit API error details: {:?}", e);
            }
            CoreError::Store(e) => {
                error!("State store error details: {:?}", e);
            }
            CoreError::Notify(e) => {
                error!("Notification error details: {:?}", e);
            }
            CoreError::Config(e) => {
                error!("Configuration error details: {:?}", e);
            }
            _ => {}
        }
        self
    }

    fn log_warn(&self) -> &Self {
        warn!("CoreError (warning): {}", self);
        self
    }

    fn is_retryable(&self) -> bool {
        match self {
            CoreError::RedditApi(e) => e.is_retryable(),
            CoreError::Store(e) => e.is_retryable(),
            CoreError::Notify(e) => e.is_retryable(),
            CoreError::Network(e) => !e.is_builder() && !e.is_redirect(),
            CoreError::Io(_) => true,
            CoreError::Timeout { .. } => true,
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            CoreError::RedditApi(e) => e.retry_after(),
            CoreError::Notify(e) => e.retry_after(),
            CoreError::Store(e) => e.retry_after(),
            CoreError::Timeout { seconds } => Some(Duration::from_secs(*seconds)),
            _ if self.is_retryable() => Some(Duration::from_secs(5)), // Default retry delay
            _ => None,
        }
    }

    fn error_code(&self) -> String {
        match self {
            CoreError::RedditApi(e) => e.error_code(),
            CoreError::Store(e) => e.error_code(),
            CoreError::Notify(e) => e.error_code(),
            CoreError::Config(e) => e.error_code(),
            CoreError::Io(_) => "IO".to_string(),
            CoreError::Serialization(_) => "SERIALIZATION".to_string(),
            CoreError::Network(_) => "NETWORK".to_string(),
            CoreError::Timeout { .. } => "TIMEOUT".to_string(),
            CoreError::Cancelled => "CANCELLED".to_string(),
            CoreError::InvariantViolation { .. } => "INVARIANT_VIOLATION".to_string(),
            CoreError::Internal { .. } => "INTERNAL".to_string(),
        }
    }
}

impl ErrorExt for RedditApiError {
    fn log_error(&self) -> &Self {
        error!("RedditApiError: {}", self);
        self
    }

    fn log_warn(&self) -> &Self {
        warn!("RedditApiError (warning): {}", self);
        self
    }

    fn is_retryable(&self) -> bool {
        match self {
            RedditApiError::RateLimitExceeded { .. } => true,
            RedditApiError::RequestTimeout => true,
            RedditApiError::ServerError { status_code } => *status_code >= 500,
            RedditApiError::InvalidResponse { .. } => true,
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            RedditApiError::RateLimitExceeded { retry_after } => {
                Some(Duration::from_secs(*retry_after))
            }
            _ if self.is_retryable() => Some(Duration::from_secs(30)),
            _ => None,
        }
    }

    fn error_code(&self) -> String {
        match self {
            RedditApiError::AuthenticationFailed { .. } => "REDDIT_AUTH_FAILED".to_string(),
            RedditApiError::RateLimitExceeded { .. } => "REDDIT_RATE_LIMIT".to_string(),
            RedditApiError::Forbidden { .. } => "REDDIT_FORBIDDEN".to_string(),
            RedditApiError::SubredditNotFound { .. } => "REDDIT_SUBREDDIT_NOT_FOUND".to_string(),
            RedditApiError::InvalidToken => "REDDIT_INVALID_TOKEN".to_string(),
            RedditApiError::RequestTimeout => "REDDIT_TIMEOUT".to_string(),
            RedditApiError::InvalidResponse { .. } => "REDDIT_INVALID_RESPONSE".to_string(),
            RedditApiError::ServerError { .. } => "REDDIT_SERVER_ERROR".to_string(),
        }
    }
}

impl ErrorExt for StoreError {
    fn log_error(&self) -> &Self {
        error!("StoreError: {}", self);
        self
    }

    fn log_warn(&self) -> &Self {
        warn!("StoreError (warning): {}", self);
        self
    }

    fn is_retryable(&self) -> bool {
        match self {
            StoreError::Unavailable { .. } => true,
            StoreError::Redis(e) => {
                e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_io_error()
                    || e.is_timeout()
                    || e.is_cluster_error()
            }
            StoreError::CorruptValue { .. } => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        if self.is_retryable() {
            Some(Duration::from_millis(500))
        } else {
            None
        }
    }

    fn error_code(&self) -> String {
        match self {
            StoreError::Unavailable { .. } => "STORE_UNAVAILABLE".to_string(),
            StoreError::CorruptValue { .. } => "STORE_CORRUPT_VALUE".to_string(),
            StoreError::Redis(_) => "STORE_REDIS".to_string(),
        }
    }
}

impl ErrorExt for NotifyError {
    fn log_error(&self) -> &Self {
        error!("NotifyError: {}", self);
        self
    }

    fn log_warn(&self) -> &Self {
        warn!("NotifyError (warning): {}", self);
        self
    }

    fn is_retryable(&self) -> bool {
        matches!(
            self,
            NotifyError::RateLimited { .. } | NotifyError::ServerError { .. }
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            NotifyError::RateLimited {
                retry_after: Some(seconds),
                ..
            } => Some(Duration::from_secs(*seconds)),
            _ => None,
        }
    }

    fn error_code(&self) -> String {
        match self {
            NotifyError::InvalidCredentials { .. } => "NOTIFY_INVALID_CREDENTIALS".to_string(),
            NotifyError::RateLimited { .. } => "NOTIFY_RATE_LIMIT".to_string(),
            NotifyError::Rejected { .. } => "NOTIFY_REJECTED".to_string(),
            NotifyError::ServerError { .. } => "NOTIFY_SERVER_ERROR".to_string(),
        }
    }
}

impl ErrorExt for ConfigError {
    fn log_error(&self) -> &Self {
        error!("ConfigError: {}", self);
        self
    }

    fn log_warn(&self) -> &Self {
        warn!("ConfigError (warning): {}", self);
        self
    }

    fn is_retryable(&self) -> bool {
        false
    }

    fn retry_after(&self) -> Option<Duration> {
        None
    }

    fn error_code(&self) -> String {
        match self {
            ConfigError::FileNotFound { .. } => "CONFIG_FILE_NOT_FOUND".to_string(),
            ConfigError::MissingField { .. } => "CONFIG_MISSING_FIELD".to_string(),
            ConfigError::InvalidValue { .. } => "CONFIG_INVALID_VALUE".to_string(),
            ConfigError::MissingEnvironmentVariable { .. } => "CONFIG_MISSING_ENV_VAR".to_string(),
            ConfigError::ValidationFailed { .. } => "CONFIG_VALIDATION_FAILED".to_string(),
            ConfigError::InvalidPattern { .. } => "CONFIG_INVALID_PATTERN".to_string(),
            ConfigError::Parse(_) => "CONFIG_PARSE_ERROR".to_string(),
        }
    }
}

pub struct ErrorReporter {
    report_errors: bool,
    report_warnings: bool,
}

impl ErrorReporter {
    pub fn new() -> Self {
        Self {
            report_errors: true,
            report_warnings: true,
        }
    }

    pub fn with_error_reporting(mut self, enabled: bool) -> Self {
        self.report_errors = enabled;
        self
    }

    pub fn with_warning_reporting(mut self, enabled: bool) -> Self {
        self.report_warnings = enabled;
        self
    }

    pub fn report_error(&self, error: &CoreError) {
        if self.report_errors {
            error.log_error();
            info!("Error code: {}", error.error_code());
            if error.is_retryable() {
                if let Some(retry_after) = error.retry_after() {
                    info!("Error is retryable. Retry after: {:?}", retry_after);
                }
            }
        }
    }

    pub fn report_warning(&self, error: &CoreError) {
        if self.report_warnings {
            error.log_warn();
        }
    }
}

impl Default for ErrorReporter {
    fn default() -> Self {
        Self::new()
    }
}
