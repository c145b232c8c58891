use crate::message::Notification;
use crate::{build_notifier, http_client, Notifier};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use subredmonitor_core::{
    BackendKind, CandidateItem, CoreError, ErrorExt, NotificationTarget, RetryConfig,
    RetryExecutor,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed { error_code: String, message: String },
    UnknownTarget,
}

/// Result of delivering one item to one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub target: String,
    pub kind: Option<BackendKind>,
    pub attempts: u32,
    pub outcome: DeliveryOutcome,
}

impl DeliveryReport {
    pub fn is_delivered(&self) -> bool {
        self.outcome == DeliveryOutcome::Delivered
    }
}

impl fmt::Display for DeliveryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            DeliveryOutcome::Delivered => {
                write!(f, "{}: delivered after {} attempt(s)", self.target, self.attempts)
            }
            DeliveryOutcome::Failed { error_code, message } => write!(
                f,
                "{}: failed after {} attempt(s) [{}] {}",
                self.target, self.attempts, error_code, message
            ),
            DeliveryOutcome::UnknownTarget => write!(f, "{}: unknown target", self.target),
        }
    }
}

struct RegisteredNotifier {
    notifier: Arc<dyn Notifier>,
    retry: RetryExecutor,
    verify_on_startup: bool,
}

/// Fans an item out to independent backends, each with its own bounded
/// retry policy.
#[derive(Default)]
pub struct NotificationDispatcher {
    notifiers: BTreeMap<String, RegisteredNotifier>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_targets(targets: &[NotificationTarget], user_agent: &str) -> Result<Self, CoreError> {
        let http = http_client(user_agent)?;
        let mut dispatcher = Self::new();
        for target in targets {
            dispatcher.register(
                build_notifier(target, http.clone()),
                target.retry.clone(),
                target.verify_on_startup,
            );
        }
        Ok(dispatcher)
    }

    pub fn register(&mut self, notifier: Arc<dyn Notifier>, retry: RetryConfig, verify_on_startup: bool) {
        info!(
            "Registered {} notifier '{}' (max {} attempts)",
            notifier.kind(),
            notifier.name(),
            retry.max_attempts
        );
        self.notifiers.insert(
            notifier.name().to_string(),
            RegisteredNotifier {
                notifier,
                retry: RetryExecutor::new(retry),
                verify_on_startup,
            },
        );
    }

    pub fn target_names(&self) -> Vec<String> {
        self.notifiers.keys().cloned().collect()
    }

    /// Check every backend flagged for startup verification. Stops at the
    /// first failure.
    pub async fn verify_all(&self) -> Result<(), CoreError> {
        for (name, registered) in &self.notifiers {
            if !registered.verify_on_startup {
                debug!("Skipping startup verification of '{}'", name);
                continue;
            }
            registered.notifier.verify().await.map_err(|e| {
                error!("Notifier '{}' failed verification: {}", name, e);
                e
            })?;
            info!("Notifier '{}' verified", name);
        }
        Ok(())
    }

    /// Deliver `item` to every named target concurrently. One target's
    /// failure never affects another.
    pub async fn dispatch(
        &self,
        item: &CandidateItem,
        targets: &[String],
        cancel: &CancellationToken,
    ) -> Vec<DeliveryReport> {
        let notification = Notification::for_item(item);
        let deliveries = targets
            .iter()
            .map(|name| self.deliver(name, &notification, cancel));
        join_all(deliveries).await
    }

    async fn deliver(
        &self,
        name: &str,
        notification: &Notification,
        cancel: &CancellationToken,
    ) -> DeliveryReport {
        let Some(registered) = self.notifiers.get(name) else {
            error!("No notifier named '{}' is registered", name);
            return DeliveryReport {
                target: name.to_string(),
                kind: None,
                attempts: 0,
                outcome: DeliveryOutcome::UnknownTarget,
            };
        };

        let operation = format!("notify {}", name);
        let outcome = registered
            .retry
            .execute(&operation, cancel, || registered.notifier.send(notification))
            .await;

        let delivery = match outcome.result {
            Ok(()) => {
                debug!("Delivered '{}' via {}", notification.description, name);
                DeliveryOutcome::Delivered
            }
            Err(e) => {
                warn!(
                    "Giving up on '{}' via {} after {} attempt(s): {}",
                    notification.description, name, outcome.attempts, e
                );
                DeliveryOutcome::Failed {
                    error_code: e.error_code(),
                    message: e.to_string(),
                }
            }
        };

        DeliveryReport {
            target: name.to_string(),
            kind: Some(registered.notifier.kind()),
            attempts: outcome.attempts,
            outcome: delivery,
        }
    }
}
