use crate::message::Notification;
use crate::{status_error, Notifier};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::Deserialize;
use subredmonitor_core::{BackendKind, CoreError, NotifyError, Secret};
use tracing::debug;

const PUSHOVER_API_BASE: &str = "https://api.pushover.net/1";

const AUTH_STATUSES: &[u16] = &[401, 403];
// Validation answers 400 for an unknown user or token
const VALIDATE_AUTH_STATUSES: &[u16] = &[400, 401, 403];
const RATE_LIMIT_STATUSES: &[u16] = &[429];

/// Body of every Pushover answer: `status` is 1 on success, otherwise
/// `errors` says why.
#[derive(Debug, Deserialize)]
pub(crate) struct PushoverReply {
    #[serde(default)]
    pub status: i64,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl PushoverReply {
    pub(crate) fn parse(body: &str) -> Option<Self> {
        serde_json::from_str(body).ok()
    }

    pub(crate) fn reason(&self) -> Option<String> {
        if self.errors.is_empty() {
            None
        } else {
            Some(self.errors.join("; "))
        }
    }
}

pub struct PushoverNotifier {
    name: String,
    app_token: Secret,
    user_key: Secret,
    priority: i8,
    device: Option<String>,
    http: Client,
    base_url: String,
}

impl PushoverNotifier {
    pub fn new(
        name: String,
        app_token: Secret,
        user_key: Secret,
        priority: i8,
        device: Option<String>,
        http: Client,
    ) -> Self {
        Self {
            name,
            app_token,
            user_key,
            priority,
            device,
            http,
            base_url: PUSHOVER_API_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn credentials(&self) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("token", self.app_token.expose().to_string()),
            ("user", self.user_key.expose().to_string()),
        ];
        if let Some(device) = &self.device {
            form.push(("device", device.clone()));
        }
        form
    }

    pub(crate) fn form(&self, notification: &Notification) -> Vec<(&'static str, String)> {
        let mut form = self.credentials();
        form.extend([
            (
                "title",
                format!("{} {}", notification.application, notification.event),
            ),
            ("message", notification.description.clone()),
            ("url", notification.url.clone()),
            ("priority", self.priority.to_string()),
        ]);
        form
    }

    async fn check(
        &self,
        response: reqwest::Response,
        auth_statuses: &[u16],
    ) -> Result<(), CoreError> {
        let status = response.status();
        let retry_after = retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        let reply = PushoverReply::parse(&body);

        if status.is_success() {
            return match reply {
                Some(reply) if reply.status != 1 => Err(CoreError::Notify(NotifyError::Rejected {
                    backend: BackendKind::Pushover.to_string(),
                    status_code: status.as_u16(),
                    body: reply.reason().unwrap_or(body),
                })),
                _ => Ok(()),
            };
        }

        let reason = reply.and_then(|r| r.reason()).unwrap_or(body);
        Err(CoreError::Notify(status_error(
            BackendKind::Pushover,
            status,
            reason,
            auth_statuses,
            RATE_LIMIT_STATUSES,
            retry_after,
        )))
    }
}

fn retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

#[async_trait]
impl Notifier for PushoverNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Pushover
    }

    async fn send(&self, notification: &Notification) -> Result<(), CoreError> {
        let response = self
            .http
            .post(format!("{}/messages.json", self.base_url))
            .form(&self.form(notification))
            .send()
            .await?;
        self.check(response, AUTH_STATUSES).await?;
        debug!("Pushover accepted notification for {}", notification.url);
        Ok(())
    }

    async fn verify(&self) -> Result<(), CoreError> {
        let response = self
            .http
            .post(format!("{}/users/validate.json", self.base_url))
            .form(&self.credentials())
            .send()
            .await?;
        self.check(response, VALIDATE_AUTH_STATUSES).await
    }
}
