//! Per-target polling state machine.
//!
//! `Idle -> Polling -> Filtering -> Deduping -> Notifying -> Idle`, with
//! `ErrorBackoff` reachable from Polling and Deduping. The poll cursor is
//! committed only at the end of Notifying, and only forward.

use notifier::NotificationDispatcher;
use reddit_client::{ContentSource, ListingBatch};
use state_store::StateStore;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use subredmonitor_core::retry::{calculate_delay, deadline_after};
use subredmonitor_core::{matches, CandidateItem, CoreError, ErrorExt, PollCursor, WatchTarget};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Collaborators shared by every monitor loop.
#[derive(Clone)]
pub struct MonitorDeps {
    pub source: Arc<dyn ContentSource>,
    pub store: Arc<dyn StateStore>,
    pub dispatcher: Arc<NotificationDispatcher>,
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub key_prefix: String,
    pub dedup_ttl: Duration,
}

#[derive(Debug)]
pub enum MonitorState {
    Idle {
        next_poll: Instant,
    },
    Polling,
    Filtering {
        batch: ListingBatch,
    },
    Deduping {
        matched: Vec<CandidateItem>,
        next_cursor: Option<PollCursor>,
    },
    Notifying {
        fresh: Vec<CandidateItem>,
        next_cursor: Option<PollCursor>,
        /// Set when the store failed partway through Deduping.
        store_error: Option<CoreError>,
    },
    ErrorBackoff {
        error: CoreError,
    },
    Stopped {
        reason: StopReason,
    },
}

impl MonitorState {
    pub fn name(&self) -> &'static str {
        match self {
            MonitorState::Idle { .. } => "idle",
            MonitorState::Polling => "polling",
            MonitorState::Filtering { .. } => "filtering",
            MonitorState::Deduping { .. } => "deduping",
            MonitorState::Notifying { .. } => "notifying",
            MonitorState::ErrorBackoff { .. } => "error_backoff",
            MonitorState::Stopped { .. } => "stopped",
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, MonitorState::Stopped { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    InvariantViolation(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Shutdown => f.write_str("shutdown"),
            StopReason::InvariantViolation(message) => write!(f, "invariant violation: {}", message),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub items_fetched: u64,
    pub items_matched: u64,
    pub items_notified: u64,
    pub delivery_failures: u64,
}

/// Final state of a loop, returned when it stops.
#[derive(Debug, Clone)]
pub struct MonitorReport {
    pub target: String,
    pub reason: StopReason,
    pub cursor: Option<PollCursor>,
    pub stats: MonitorStats,
}

#[derive(Debug, Default)]
struct CycleSummary {
    id: Option<Uuid>,
    fetched: usize,
    matched: usize,
    fresh: usize,
    delivered: usize,
    failed: usize,
    /// The listing still holds unread posts past this batch.
    behind: bool,
}

pub struct MonitorLoop {
    target: WatchTarget,
    deps: MonitorDeps,
    settings: LoopSettings,
    cursor: Option<PollCursor>,
    cursor_loaded: bool,
    consecutive_failures: u32,
    cycle_started: Instant,
    cycle: CycleSummary,
    stats: MonitorStats,
}

impl MonitorLoop {
    pub fn new(target: WatchTarget, deps: MonitorDeps, settings: LoopSettings) -> Self {
        Self {
            target,
            deps,
            settings,
            cursor: None,
            cursor_loaded: false,
            consecutive_failures: 0,
            cycle_started: Instant::now(),
            cycle: CycleSummary::default(),
            stats: MonitorStats::default(),
        }
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    pub fn cursor(&self) -> Option<&PollCursor> {
        self.cursor.as_ref()
    }

    pub fn stats(&self) -> &MonitorStats {
        &self.stats
    }

    pub fn initial_state() -> MonitorState {
        MonitorState::Idle {
            next_poll: Instant::now(),
        }
    }

    /// Run until shutdown or an invariant violation.
    pub async fn run(mut self, cancel: CancellationToken) -> MonitorReport {
        info!(
            "Monitoring r/{} as '{}' every {:?}",
            self.target.subreddit, self.target.name, self.target.poll_interval
        );

        let mut state = Self::initial_state();
        let reason = loop {
            state = self.step(state, &cancel).await;
            if let MonitorState::Stopped { reason } = &state {
                break reason.clone();
            }
        };

        info!("Monitor '{}' stopped: {}", self.target.name, reason);
        MonitorReport {
            target: self.target.name.clone(),
            reason,
            cursor: self.cursor.clone(),
            stats: self.stats.clone(),
        }
    }

    /// Advance the state machine by one transition.
    pub async fn step(&mut self, state: MonitorState, cancel: &CancellationToken) -> MonitorState {
        debug!("'{}' entering {}", self.target.name, state.name());
        match state {
            MonitorState::Idle { next_poll } => self.idle(next_poll, cancel).await,
            MonitorState::Polling => self.poll(cancel).await,
            MonitorState::Filtering { batch } => self.filter(batch),
            MonitorState::Deduping {
                matched,
                next_cursor,
            } => self.dedup(matched, next_cursor).await,
            MonitorState::Notifying {
                fresh,
                next_cursor,
                store_error,
            } => self.notify(fresh, next_cursor, store_error, cancel).await,
            MonitorState::ErrorBackoff { error } => self.backoff(error, cancel).await,
            stopped @ MonitorState::Stopped { .. } => stopped,
        }
    }

    async fn idle(&mut self, next_poll: Instant, cancel: &CancellationToken) -> MonitorState {
        tokio::select! {
            _ = cancel.cancelled() => MonitorState::Stopped { reason: StopReason::Shutdown },
            _ = sleep_until(next_poll) => MonitorState::Polling,
        }
    }

    async fn poll(&mut self, cancel: &CancellationToken) -> MonitorState {
        if cancel.is_cancelled() {
            return MonitorState::Stopped {
                reason: StopReason::Shutdown,
            };
        }

        self.cycle_started = Instant::now();
        self.cycle = CycleSummary {
            id: Some(Uuid::new_v4()),
            ..CycleSummary::default()
        };

        if !self.cursor_loaded {
            match self.deps.store.load_cursor(&self.target.name).await {
                Ok(cursor) => {
                    match &cursor {
                        Some(c) => info!("'{}' resuming after {}", self.target.name, c),
                        None => info!("'{}' has no saved cursor, starting fresh", self.target.name),
                    }
                    self.cursor = cursor;
                    self.cursor_loaded = true;
                }
                Err(error) => return MonitorState::ErrorBackoff { error },
            }
        }

        match self
            .deps
            .source
            .list_new_items(&self.target.subreddit, self.cursor.as_ref(), cancel)
            .await
        {
            Ok(batch) => MonitorState::Filtering { batch },
            Err(CoreError::Cancelled) => MonitorState::Stopped {
                reason: StopReason::Shutdown,
            },
            Err(error) => MonitorState::ErrorBackoff { error },
        }
    }

    fn filter(&mut self, batch: ListingBatch) -> MonitorState {
        if batch.truncated {
            warn!(
                "'{}' fell behind r/{}; polling again right after this batch",
                self.target.name, self.target.subreddit
            );
        }
        self.cycle.behind = batch.truncated;

        self.cycle.fetched = batch.items.len();
        let matched: Vec<CandidateItem> = batch
            .items
            .into_iter()
            .filter(|item| matches(item, &self.target.rules))
            .collect();
        self.cycle.matched = matched.len();

        for item in &matched {
            debug!("'{}' matched {} \"{}\"", self.target.name, item.id, item.title);
        }

        MonitorState::Deduping {
            matched,
            next_cursor: batch.next_cursor,
        }
    }

    async fn dedup(
        &mut self,
        matched: Vec<CandidateItem>,
        next_cursor: Option<PollCursor>,
    ) -> MonitorState {
        let mut fresh = Vec::with_capacity(matched.len());
        let mut store_error = None;

        for item in matched {
            let key = self.target.dedup_key(&self.settings.key_prefix, &item);
            match self
                .deps
                .store
                .mark_seen_if_new(&key, self.settings.dedup_ttl)
                .await
            {
                Ok(true) => fresh.push(item),
                Ok(false) => debug!("'{}' already alerted on {}", self.target.name, item.id),
                Err(error) => {
                    error.log_warn();
                    store_error = Some(error);
                    break;
                }
            }
        }

        self.cycle.fresh = fresh.len();
        MonitorState::Notifying {
            fresh,
            next_cursor,
            store_error,
        }
    }

    async fn notify(
        &mut self,
        fresh: Vec<CandidateItem>,
        next_cursor: Option<PollCursor>,
        store_error: Option<CoreError>,
        cancel: &CancellationToken,
    ) -> MonitorState {
        // Oldest first, one item at a time, so alerts arrive in order.
        for item in &fresh {
            info!(
                "r/{}: hit for '{}': \"{}\" {}",
                item.subreddit,
                self.target.name,
                item.title,
                item.permalink_url()
            );
            let reports = self
                .deps
                .dispatcher
                .dispatch(item, &self.target.notify, cancel)
                .await;
            for report in reports {
                if report.is_delivered() {
                    self.cycle.delivered += 1;
                } else {
                    error!("Delivery of {} failed: {}", item.id, report);
                    self.cycle.failed += 1;
                }
            }
        }

        if let Some(error) = store_error {
            return MonitorState::ErrorBackoff { error };
        }

        if let Err(error) = self.commit_cursor(next_cursor).await {
            error.log_error();
            return MonitorState::Stopped {
                reason: StopReason::InvariantViolation(error.to_string()),
            };
        }

        self.finish_cycle();

        if cancel.is_cancelled() {
            return MonitorState::Stopped {
                reason: StopReason::Shutdown,
            };
        }
        let next_poll = if self.cycle.behind {
            Instant::now()
        } else {
            deadline_after(self.cycle_started, self.target.poll_interval)
        };
        MonitorState::Idle { next_poll }
    }

    async fn commit_cursor(&mut self, next: Option<PollCursor>) -> Result<(), CoreError> {
        let Some(next) = next else {
            return Ok(());
        };

        if let Some(current) = &self.cursor {
            if next < *current {
                return Err(CoreError::InvariantViolation {
                    message: format!(
                        "cursor for '{}' would move backward from {} to {}",
                        self.target.name, current, next
                    ),
                });
            }
            if next == *current {
                return Ok(());
            }
        }

        if let Err(e) = self.deps.store.save_cursor(&self.target.name, &next).await {
            // Dedup marks still guard against repeats after a restart.
            warn!(
                "Could not persist cursor for '{}', keeping it in memory: {}",
                self.target.name, e
            );
        }
        debug!("'{}' cursor advanced to {}", self.target.name, next);
        self.cursor = Some(next);
        Ok(())
    }

    fn finish_cycle(&mut self) {
        self.consecutive_failures = 0;
        self.stats.cycles_completed += 1;
        self.stats.items_fetched += self.cycle.fetched as u64;
        self.stats.items_matched += self.cycle.matched as u64;
        self.stats.items_notified += self.cycle.fresh as u64;
        self.stats.delivery_failures += self.cycle.failed as u64;

        info!(
            "Cycle {} for r/{} ('{}'): fetched {}, matched {}, new {}, delivered {}, failed deliveries {}",
            self.cycle_label(),
            self.target.subreddit,
            self.target.name,
            self.cycle.fetched,
            self.cycle.matched,
            self.cycle.fresh,
            self.cycle.delivered,
            self.cycle.failed
        );
    }

    fn cycle_label(&self) -> String {
        self.cycle
            .id
            .map(|id| id.simple().to_string()[..8].to_string())
            .unwrap_or_else(|| "-".to_string())
    }

    async fn backoff(&mut self, error: CoreError, cancel: &CancellationToken) -> MonitorState {
        self.stats.cycles_failed += 1;
        let delay = calculate_delay(self.consecutive_failures, &self.target.error_backoff);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        warn!(
            "Cycle {} for r/{} ('{}') failed [{}]: {}; retrying in {:?}",
            self.cycle_label(),
            self.target.subreddit,
            self.target.name,
            error.error_code(),
            error,
            delay
        );

        tokio::select! {
            _ = cancel.cancelled() => MonitorState::Stopped { reason: StopReason::Shutdown },
            _ = tokio::time::sleep(delay) => MonitorState::Polling,
        }
    }
}
