use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info};

use crate::gitlab::GitLabApi;
use crate::reconciliation::{CycleSummary, ReconciliationEngine};
use crate::redmine::RedmineApi;

/// State published after every cycle for the /status endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub cycles_completed: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_cycle: Option<CycleSummary>,
    pub tracked_issues: usize,
}

/// Drives reconciliation cycles: once immediately at startup, then at each
/// occurrence of the cron schedule.
///
/// The loop awaits the running cycle before computing the next occurrence,
/// so cycles never overlap. A shutdown signal is only observed between
/// cycles; the in-flight cycle always completes.
pub struct Scheduler<R, G> {
    engine: ReconciliationEngine<R, G>,
    schedule: Schedule,
    status_tx: watch::Sender<StatusSnapshot>,
    cycles_completed: u64,
}

impl<R: RedmineApi, G: GitLabApi> Scheduler<R, G> {
    pub fn new(
        engine: ReconciliationEngine<R, G>,
        schedule: Schedule,
        status_tx: watch::Sender<StatusSnapshot>,
    ) -> Self {
        Self {
            engine,
            schedule,
            status_tx,
            cycles_completed: 0,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<()>) {
        self.tick().await;

        loop {
            let Some(next) = self.schedule.upcoming(Utc).next() else {
                error!("Cron schedule has no future occurrences; scheduler exiting");
                return;
            };
            info!("Next scheduled run: {}", next.format("%Y-%m-%d %H:%M:%S UTC"));

            tokio::select! {
                () = tokio::time::sleep(sleep_duration_until(next, Utc::now())) => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("Scheduler stopped");
                    return;
                }
            }
        }
    }

    async fn tick(&mut self) {
        let summary = self.engine.run_cycle().await;
        self.cycles_completed += 1;

        let snapshot = StatusSnapshot {
            cycles_completed: self.cycles_completed,
            last_run: Some(Utc::now()),
            last_cycle: Some(summary),
            tracked_issues: self.engine.tracked_issues(),
        };
        let _ = self.status_tx.send(snapshot);
    }
}

/// How long to sleep until `next`. An occurrence already in the past (the
/// previous cycle overran it) yields a zero sleep, i.e. run immediately.
fn sleep_duration_until(next: DateTime<Utc>, now: DateTime<Utc>) -> std::time::Duration {
    (next - now).to_std().unwrap_or_default()
}
