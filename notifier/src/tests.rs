#[cfg(test)]
mod tests {
    use crate::dispatcher::{DeliveryOutcome, NotificationDispatcher};
    use crate::message::Notification;
    use crate::pushover::PushoverReply;
    use crate::{build_notifier, http_client, status_error, Notifier, ProwlNotifier, PushoverNotifier};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use reqwest::StatusCode;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use subredmonitor_core::{
        BackendKind, BackendSpec, CandidateItem, CoreError, NotificationTarget, NotifyError,
        RetryConfig, Secret,
    };
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    /// Backend that fails according to a script, then succeeds.
    struct FakeNotifier {
        name: String,
        kind: BackendKind,
        failures: Mutex<VecDeque<NotifyError>>,
        always_fail: bool,
        sent: Mutex<Vec<Notification>>,
        attempts: Mutex<u32>,
        verify_ok: bool,
    }

    impl FakeNotifier {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                kind: BackendKind::Prowl,
                failures: Mutex::new(VecDeque::new()),
                always_fail: false,
                sent: Mutex::new(Vec::new()),
                attempts: Mutex::new(0),
                verify_ok: true,
            }
        }

        fn failing(name: &str) -> Self {
            Self {
                always_fail: true,
                ..Self::new(name)
            }
        }

        fn with_failures(name: &str, failures: Vec<NotifyError>) -> Self {
            Self {
                failures: Mutex::new(failures.into()),
                ..Self::new(name)
            }
        }

        fn attempts(&self) -> u32 {
            *self.attempts.lock().unwrap()
        }

        fn sent(&self) -> Vec<Notification> {
            self.sent.lock().unwrap().clone()
        }
    }

    fn server_error(backend: &str) -> NotifyError {
        NotifyError::ServerError {
            backend: backend.to_string(),
            status_code: 503,
        }
    }

    #[async_trait]
    impl Notifier for FakeNotifier {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> BackendKind {
            self.kind
        }

        async fn send(&self, notification: &Notification) -> Result<(), CoreError> {
            *self.attempts.lock().unwrap() += 1;
            if self.always_fail {
                return Err(CoreError::Notify(server_error(&self.name)));
            }
            if let Some(failure) = self.failures.lock().unwrap().pop_front() {
                return Err(CoreError::Notify(failure));
            }
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }

        async fn verify(&self) -> Result<(), CoreError> {
            if self.verify_ok {
                Ok(())
            } else {
                Err(CoreError::Notify(NotifyError::InvalidCredentials {
                    backend: self.name.clone(),
                    reason: "bad key".to_string(),
                }))
            }
        }
    }

    fn retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 1000,
            max_delay_ms: 8000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    fn giveaway() -> CandidateItem {
        CandidateItem {
            id: "t3_abc".to_string(),
            subreddit: "hardware".to_string(),
            title: "Free GPU giveaway".to_string(),
            body: String::new(),
            author: "bob".to_string(),
            score: 50,
            flair: None,
            created_utc: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            permalink: "/r/hardware/comments/abc/free_gpu_giveaway/".to_string(),
            url: "https://example.com/gpu".to_string(),
            is_self: false,
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_notification_content() {
        let notification = Notification::for_item(&giveaway());
        assert_eq!(notification.application, "subredmonitor");
        assert_eq!(notification.event, "Hit");
        assert_eq!(notification.description, "Free GPU giveaway");
        assert_eq!(
            notification.url,
            "https://www.reddit.com/r/hardware/comments/abc/free_gpu_giveaway/"
        );
    }

    #[tokio::test]
    async fn test_dispatch_reaches_every_target() {
        let prowl = Arc::new(FakeNotifier::new("phone"));
        let pushover = Arc::new(FakeNotifier::new("tablet"));
        let mut dispatcher = NotificationDispatcher::new();
        dispatcher.register(prowl.clone(), retry(3), true);
        dispatcher.register(pushover.clone(), retry(3), true);

        let cancel = CancellationToken::new();
        let reports = dispatcher
            .dispatch(&giveaway(), &names(&["phone", "tablet"]), &cancel)
            .await;

        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.is_delivered()));
        assert_eq!(prowl.sent().len(), 1);
        assert_eq!(pushover.sent()[0].description, "Free GPU giveaway");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_backend_does_not_block_the_other() {
        let broken = Arc::new(FakeNotifier::failing("phone"));
        let healthy = Arc::new(FakeNotifier::new("tablet"));
        let mut dispatcher = NotificationDispatcher::new();
        dispatcher.register(broken.clone(), retry(4), true);
        dispatcher.register(healthy.clone(), retry(4), true);

        let cancel = CancellationToken::new();
        let reports = dispatcher
            .dispatch(&giveaway(), &names(&["phone", "tablet"]), &cancel)
            .await;

        let phone = reports.iter().find(|r| r.target == "phone").unwrap();
        assert_eq!(phone.attempts, 4);
        assert!(matches!(
            &phone.outcome,
            DeliveryOutcome::Failed { error_code, .. } if error_code == "NOTIFY_SERVER_ERROR"
        ));
        assert_eq!(broken.attempts(), 4);

        let tablet = reports.iter().find(|r| r.target == "tablet").unwrap();
        assert!(tablet.is_delivered());
        assert_eq!(healthy.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried_with_backoff() {
        let flaky = Arc::new(FakeNotifier::with_failures(
            "phone",
            vec![server_error("prowl"), server_error("prowl")],
        ));
        let mut dispatcher = NotificationDispatcher::new();
        dispatcher.register(flaky.clone(), retry(5), true);

        let start = Instant::now();
        let reports = dispatcher
            .dispatch(&giveaway(), &names(&["phone"]), &CancellationToken::new())
            .await;

        assert!(reports[0].is_delivered());
        assert_eq!(reports[0].attempts, 3);
        // 1s then 2s
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_credentials_are_not_retried() {
        let rejected = Arc::new(FakeNotifier::with_failures(
            "phone",
            vec![NotifyError::InvalidCredentials {
                backend: "prowl".to_string(),
                reason: "invalid API key".to_string(),
            }],
        ));
        let mut dispatcher = NotificationDispatcher::new();
        dispatcher.register(rejected.clone(), retry(5), true);

        let reports = dispatcher
            .dispatch(&giveaway(), &names(&["phone"]), &CancellationToken::new())
            .await;

        assert!(!reports[0].is_delivered());
        assert_eq!(reports[0].attempts, 1);
        assert_eq!(rejected.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_waits_for_requested_delay() {
        let limited = Arc::new(FakeNotifier::with_failures(
            "tablet",
            vec![NotifyError::RateLimited {
                backend: "pushover".to_string(),
                retry_after: Some(30),
            }],
        ));
        let mut dispatcher = NotificationDispatcher::new();
        dispatcher.register(limited.clone(), retry(3), true);

        let start = Instant::now();
        let reports = dispatcher
            .dispatch(&giveaway(), &names(&["tablet"]), &CancellationToken::new())
            .await;

        assert!(reports[0].is_delivered());
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_cuts_retries_short() {
        let broken = Arc::new(FakeNotifier::failing("phone"));
        let mut dispatcher = NotificationDispatcher::new();
        dispatcher.register(broken.clone(), retry(10), true);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let reports = dispatcher
            .dispatch(&giveaway(), &names(&["phone"]), &cancel)
            .await;

        // The attempt in flight still happens; no retry follows.
        assert_eq!(reports[0].attempts, 1);
        assert!(!reports[0].is_delivered());
    }

    #[tokio::test]
    async fn test_unknown_target_is_reported() {
        let dispatcher = NotificationDispatcher::new();
        let reports = dispatcher
            .dispatch(&giveaway(), &names(&["ghost"]), &CancellationToken::new())
            .await;
        assert_eq!(reports[0].outcome, DeliveryOutcome::UnknownTarget);
        assert!(reports[0].to_string().contains("unknown target"));
    }

    #[tokio::test]
    async fn test_verify_all_honours_startup_flag() {
        let bad = Arc::new(FakeNotifier {
            verify_ok: false,
            ..FakeNotifier::new("phone")
        });

        let mut skipping = NotificationDispatcher::new();
        skipping.register(bad.clone(), retry(3), false);
        assert!(skipping.verify_all().await.is_ok());

        let mut checking = NotificationDispatcher::new();
        checking.register(bad, retry(3), true);
        let err = checking.verify_all().await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::Notify(NotifyError::InvalidCredentials { .. })
        ));
    }

    #[test]
    fn test_status_mapping() {
        let auth = status_error(
            BackendKind::Prowl,
            StatusCode::UNAUTHORIZED,
            "<error code=\"401\">Invalid API key</error>".to_string(),
            &[401, 409],
            &[406],
            None,
        );
        assert!(matches!(auth, NotifyError::InvalidCredentials { ref backend, .. } if backend == "prowl"));

        let limited = status_error(
            BackendKind::Prowl,
            StatusCode::NOT_ACCEPTABLE,
            String::new(),
            &[401, 409],
            &[406],
            None,
        );
        assert!(matches!(limited, NotifyError::RateLimited { .. }));

        let server = status_error(
            BackendKind::Pushover,
            StatusCode::BAD_GATEWAY,
            String::new(),
            &[401],
            &[429],
            None,
        );
        assert!(matches!(server, NotifyError::ServerError { status_code: 502, .. }));

        let rejected = status_error(
            BackendKind::Pushover,
            StatusCode::BAD_REQUEST,
            "x".repeat(500),
            &[401],
            &[429],
            None,
        );
        match rejected {
            NotifyError::Rejected { status_code, body, .. } => {
                assert_eq!(status_code, 400);
                assert!(body.len() < 250);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_backend_forms_carry_priority_and_url() {
        let http = http_client("subredmonitor v0.1").unwrap();
        let notification = Notification::for_item(&giveaway());

        let prowl = ProwlNotifier::new("phone".to_string(), Secret::new("key"), 2, http.clone());
        let form = prowl.form(&notification);
        assert!(form.contains(&("priority", "2".to_string())));
        assert!(form.contains(&("event", "Hit".to_string())));
        assert!(form.contains(&("application", "subredmonitor".to_string())));

        let pushover = PushoverNotifier::new(
            "tablet".to_string(),
            Secret::new("app"),
            Secret::new("user"),
            -1,
            Some("iphone".to_string()),
            http,
        );
        let form = pushover.form(&notification);
        assert!(form.contains(&("device", "iphone".to_string())));
        assert!(form.contains(&("message", "Free GPU giveaway".to_string())));
        assert!(form.contains(&("priority", "-1".to_string())));
    }

    #[test]
    fn test_build_notifier_from_target() {
        let http = http_client("subredmonitor v0.1").unwrap();
        let target = NotificationTarget {
            name: "tablet".to_string(),
            backend: BackendSpec::Pushover {
                app_token: Secret::new("app"),
                user_key: Secret::new("user"),
                priority: 0,
                device: None,
            },
            retry: RetryConfig::default(),
            verify_on_startup: true,
        };
        let notifier = build_notifier(&target, http);
        assert_eq!(notifier.name(), "tablet");
        assert_eq!(notifier.kind(), BackendKind::Pushover);

        let dispatcher =
            NotificationDispatcher::from_targets(&[target], "subredmonitor v0.1").unwrap();
        assert_eq!(dispatcher.target_names(), vec!["tablet".to_string()]);
    }

    #[test]
    fn test_pushover_reply_explains_rejection() {
        let failed = PushoverReply::parse(
            r#"{"user":"invalid","errors":["user identifier is invalid","device is unknown"],"status":0,"request":"5042853c"}"#,
        )
        .unwrap();
        assert_eq!(failed.status, 0);
        assert_eq!(
            failed.reason().as_deref(),
            Some("user identifier is invalid; device is unknown")
        );

        let accepted = PushoverReply::parse(r#"{"status":1,"request":"647d2300"}"#).unwrap();
        assert_eq!(accepted.status, 1);
        assert_eq!(accepted.reason(), None);

        assert!(PushoverReply::parse("<html>bad gateway</html>").is_none());
    }
}
