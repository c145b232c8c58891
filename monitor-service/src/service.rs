use crate::monitor::{LoopSettings, MonitorDeps, MonitorLoop, MonitorReport, StopReason};
use subredmonitor_core::WatchTarget;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Runs one independent monitor loop per watch target.
pub struct MonitorService {
    deps: MonitorDeps,
    settings: LoopSettings,
    cancel: CancellationToken,
    tasks: JoinSet<MonitorReport>,
}

impl MonitorService {
    pub fn new(deps: MonitorDeps, settings: LoopSettings) -> Self {
        Self {
            deps,
            settings,
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
        }
    }

    pub fn start(&mut self, targets: Vec<WatchTarget>) {
        for target in targets {
            let monitor = MonitorLoop::new(target, self.deps.clone(), self.settings.clone());
            let cancel = self.cancel.child_token();
            self.tasks.spawn(monitor.run(cancel));
        }
        info!("Started {} monitor loop(s)", self.tasks.len());
    }

    pub fn running(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for the next loop to stop on its own. `None` once every loop
    /// has ended.
    pub async fn join_next(&mut self) -> Option<MonitorReport> {
        loop {
            match self.tasks.join_next().await? {
                Ok(report) => return Some(report),
                Err(e) => error!("Monitor task aborted: {}", e),
            }
        }
    }

    /// Push each report as its loop stops on its own. Reports already
    /// pushed stay in `reports` when this future is dropped early.
    pub async fn collect_stopped(&mut self, reports: &mut Vec<MonitorReport>) {
        while let Some(report) = self.join_next().await {
            if let StopReason::InvariantViolation(message) = &report.reason {
                error!("Monitor '{}' halted: {}", report.target, message);
            }
            reports.push(report);
        }
    }

    /// Signal every loop to stop and wait for them. Loops in the middle of
    /// a dedup or notify step finish their cycle first.
    pub async fn shutdown(&mut self) -> Vec<MonitorReport> {
        info!("Stopping {} monitor loop(s)", self.tasks.len());
        self.cancel.cancel();

        let mut reports = Vec::new();
        while let Some(report) = self.join_next().await {
            reports.push(report);
        }
        reports
    }
}
