use crate::message::Notification;
use crate::{status_error, Notifier};
use async_trait::async_trait;
use reqwest::Client;
use subredmonitor_core::{BackendKind, CoreError, Secret};
use tracing::debug;

const PROWL_API_BASE: &str = "https://api.prowlapp.com/publicapi";

// 401 bad key, 409 token not approved by the user
const AUTH_STATUSES: &[u16] = &[401, 409];
const RATE_LIMIT_STATUSES: &[u16] = &[406];

pub struct ProwlNotifier {
    name: String,
    api_key: Secret,
    priority: i8,
    http: Client,
    base_url: String,
}

impl ProwlNotifier {
    pub fn new(name: String, api_key: Secret, priority: i8, http: Client) -> Self {
        Self {
            name,
            api_key,
            priority,
            http,
            base_url: PROWL_API_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub(crate) fn form(&self, notification: &Notification) -> Vec<(&'static str, String)> {
        vec![
            ("apikey", self.api_key.expose().to_string()),
            ("application", notification.application.clone()),
            ("event", notification.event.clone()),
            ("description", notification.description.clone()),
            ("priority", self.priority.to_string()),
            ("url", notification.url.clone()),
        ]
    }

    async fn check(&self, response: reqwest::Response) -> Result<(), CoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(CoreError::Notify(status_error(
            BackendKind::Prowl,
            status,
            body,
            AUTH_STATUSES,
            RATE_LIMIT_STATUSES,
            None,
        )))
    }
}

#[async_trait]
impl Notifier for ProwlNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Prowl
    }

    async fn send(&self, notification: &Notification) -> Result<(), CoreError> {
        let response = self
            .http
            .post(format!("{}/add", self.base_url))
            .form(&self.form(notification))
            .send()
            .await?;
        self.check(response).await?;
        debug!("Prowl accepted notification for {}", notification.url);
        Ok(())
    }

    async fn verify(&self) -> Result<(), CoreError> {
        let response = self
            .http
            .get(format!("{}/verify", self.base_url))
            .query(&[("apikey", self.api_key.expose())])
            .send()
            .await?;
        self.check(response).await
    }
}
