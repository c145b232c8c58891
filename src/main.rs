use anyhow::Context;
use clap::Parser;
use monitor_service::{LoopSettings, MonitorDeps, MonitorReport, MonitorService};
use notifier::NotificationDispatcher;
use reddit_client::{
    ContentSource, CredentialProvider, PasswordGrant, RedditApiClient, RedditSource,
    SourceSettings,
};
use state_store::{InMemoryStateStore, RedisStateStore, StateStore};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use subredmonitor_core::config::{ProcessEnv, Settings, StoreBackend};
use subredmonitor_core::ErrorExt;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_RUNTIME: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_STARTUP: u8 = 3;

/// Watch subreddits and push an alert for every new matching post.
#[derive(Debug, Parser)]
#[command(name = "subredmonitor", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "SUBREDMONITOR_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    /// Log filter, overridden by RUST_LOG when set.
    #[arg(long, default_value = "subredmonitor=info,monitor_service=info,reddit_client=info,state_store=info,notifier=info,subredmonitor_core=info")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting subredmonitor {}", env!("CARGO_PKG_VERSION"));

    let settings = match Settings::load(&cli.config, &ProcessEnv) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Invalid configuration in {}: {}", cli.config.display(), e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let (deps, api) = match connect(&settings).await {
        Ok(ready) => ready,
        Err(e) => {
            error!("Startup failed: {:#}", e);
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    let loop_settings = LoopSettings {
        key_prefix: settings.store.key_prefix.clone(),
        dedup_ttl: settings.store.dedup_ttl,
    };
    let mut service = MonitorService::new(deps, loop_settings);
    service.start(settings.watch_targets.clone());

    // Reports gathered before a signal arrives must survive the race.
    let mut reports = Vec::new();
    let signalled = tokio::select! {
        _ = shutdown_signal() => true,
        _ = service.collect_stopped(&mut reports) => false,
    };

    let code = if signalled {
        info!("Shutdown requested, finishing in-flight cycles");
        reports.extend(service.shutdown().await);
        log_reports(&reports);
        ExitCode::SUCCESS
    } else {
        log_reports(&reports);
        error!("Every monitor loop has stopped");
        ExitCode::from(EXIT_RUNTIME)
    };

    let metrics = api.get_metrics().await;
    info!(
        "Reddit API: {} requests, {} failed, {} rate limited, average {:?}",
        metrics.total_requests,
        metrics.failed_requests,
        metrics.rate_limited_requests,
        metrics.average_response_time()
    );
    code
}

/// Build the shared collaborators and check every external dependency
/// once before any loop starts.
async fn connect(settings: &Settings) -> anyhow::Result<(MonitorDeps, Arc<RedditApiClient>)> {
    let store: Arc<dyn StateStore> = match settings.store.backend {
        StoreBackend::Redis => Arc::new(
            RedisStateStore::connect(&settings.store.url, &settings.store.key_prefix)
                .await
                .context("connecting to the state store")?,
        ),
        StoreBackend::Memory => {
            warn!("Using the in-memory state store; alerts may repeat after a restart");
            Arc::new(InMemoryStateStore::new())
        }
    };
    store.ping().await.context("pinging the state store")?;

    let reddit = &settings.reddit;
    let grant = PasswordGrant::new(&reddit.credentials, &reddit.token_url, &reddit.user_agent)
        .context("building the Reddit token client")?;
    let tokens = Arc::new(CredentialProvider::new(grant));
    let api = Arc::new(
        RedditApiClient::new(&reddit.user_agent, &reddit.api_base)
            .context("building the Reddit API client")?,
    );
    let source: Arc<dyn ContentSource> = Arc::new(RedditSource::new(
        api.clone(),
        tokens,
        SourceSettings::from(reddit),
    ));

    let dispatcher = NotificationDispatcher::from_targets(
        &settings.notification_targets,
        &reddit.user_agent,
    )
    .context("building notifiers")?;
    if let Err(e) = dispatcher.verify_all().await {
        e.log_error();
        return Err(e).context("verifying notifier credentials");
    }

    Ok((
        MonitorDeps {
            source,
            store,
            dispatcher: Arc::new(dispatcher),
        },
        api,
    ))
}

fn log_reports(reports: &[MonitorReport]) {
    for report in reports {
        let cursor = report
            .cursor
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "-".to_string());
        info!(
            "'{}' stopped ({}) at {}: {} cycles, {} failed, {} alerts, {} delivery failures",
            report.target,
            report.reason,
            cursor,
            report.stats.cycles_completed,
            report.stats.cycles_failed,
            report.stats.items_notified,
            report.stats.delivery_failures
        );
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
