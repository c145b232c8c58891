pub mod dispatcher;
pub mod message;
pub mod prowl;
pub mod pushover;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use subredmonitor_core::{BackendKind, BackendSpec, CoreError, NotificationTarget, NotifyError};

pub use dispatcher::{DeliveryOutcome, DeliveryReport, NotificationDispatcher};
pub use message::Notification;
pub use prowl::ProwlNotifier;
pub use pushover::PushoverNotifier;

/// A push-notification backend.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Configured target name.
    fn name(&self) -> &str;

    fn kind(&self) -> BackendKind;

    /// One delivery attempt; retries are the dispatcher's job.
    async fn send(&self, notification: &Notification) -> Result<(), CoreError>;

    /// Check the configured credentials without sending anything.
    async fn verify(&self) -> Result<(), CoreError>;
}

pub fn http_client(user_agent: &str) -> Result<Client, CoreError> {
    Ok(Client::builder()
        .user_agent(user_agent)
        .timeout(Duration::from_secs(20))
        .build()?)
}

/// Instantiate the backend named by `target`.
pub fn build_notifier(target: &NotificationTarget, http: Client) -> Arc<dyn Notifier> {
    match &target.backend {
        BackendSpec::Prowl { api_key, priority } => Arc::new(ProwlNotifier::new(
            target.name.clone(),
            api_key.clone(),
            *priority,
            http,
        )),
        BackendSpec::Pushover {
            app_token,
            user_key,
            priority,
            device,
        } => Arc::new(PushoverNotifier::new(
            target.name.clone(),
            app_token.clone(),
            user_key.clone(),
            *priority,
            device.clone(),
            http,
        )),
    }
}

/// Map a non-2xx answer to a delivery error. `auth_statuses` are the codes
/// the backend uses for bad keys.
pub(crate) fn status_error(
    backend: BackendKind,
    status: StatusCode,
    body: String,
    auth_statuses: &[u16],
    rate_limit_statuses: &[u16],
    retry_after: Option<u64>,
) -> NotifyError {
    let backend = backend.to_string();
    let code = status.as_u16();

    if auth_statuses.contains(&code) {
        NotifyError::InvalidCredentials {
            backend,
            reason: truncate(&body),
        }
    } else if rate_limit_statuses.contains(&code) {
        NotifyError::RateLimited {
            backend,
            retry_after,
        }
    } else if status.is_server_error() {
        NotifyError::ServerError {
            backend,
            status_code: code,
        }
    } else {
        NotifyError::Rejected {
            backend,
            status_code: code,
            body: truncate(&body),
        }
    }
}

fn truncate(body: &str) -> String {
    const LIMIT: usize = 200;
    let trimmed = body.trim();
    match trimmed.char_indices().nth(LIMIT) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
