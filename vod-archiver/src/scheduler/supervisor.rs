//! Channel supervisor.
//!
//! Built once at startup from the configured channels; each channel gets its
//! own cancellation scope and one task per enabled job. Channels never share
//! in-process state, so a failing job only ever affects its own channel.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::task::{JobKind, TaskId};
use crate::catalog::CatalogBackfillJob;
use crate::chat::ChatRecorder;
use crate::processing::ProcessingJob;
use crate::retention::RetentionJob;

/// The jobs built for one channel. `None` means disabled.
#[derive(Default)]
pub struct ChannelJobs {
    pub catalog: Option<Arc<CatalogBackfillJob>>,
    pub processing: Option<Arc<ProcessingJob>>,
    pub retention: Option<Arc<RetentionJob>>,
    pub chat: Option<Arc<ChatRecorder>>,
}

impl ChannelJobs {
    fn kinds(&self) -> Vec<JobKind> {
        let mut kinds = Vec::new();
        if self.catalog.is_some() {
            kinds.push(JobKind::Catalog);
        }
        if self.processing.is_some() {
            kinds.push(JobKind::Processing);
        }
        if self.retention.as_ref().is_some_and(|r| r.is_active()) {
            kinds.push(JobKind::Retention);
        }
        if self.chat.is_some() {
            kinds.push(JobKind::Chat);
        }
        kinds
    }
}

/// Report of a shutdown.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    pub total_tasks: usize,
    pub graceful_stops: usize,
    /// Tasks that panicked.
    pub crashed: usize,
    /// Tasks aborted after the timeout.
    pub forced_terminations: usize,
}

impl ShutdownReport {
    pub fn all_graceful(&self) -> bool {
        self.forced_terminations == 0 && self.crashed == 0
    }
}

/// Fixed table of channel task sets.
pub struct ChannelSupervisor {
    cancel: CancellationToken,
    tasks: JoinSet<TaskId>,
}

impl ChannelSupervisor {
    /// Spawn every channel's jobs under `parent`.
    pub fn start(jobs: BTreeMap<String, ChannelJobs>, parent: &CancellationToken) -> Self {
        let cancel = parent.child_token();
        let mut tasks = JoinSet::new();

        for (channel, set) in jobs {
            let token = cancel.child_token();
            let kinds = set.kinds();

            if let Some(job) = set.catalog {
                spawn(&mut tasks, &channel, JobKind::Catalog, job.run(token.clone()));
            }
            if let Some(job) = set.processing {
                spawn(&mut tasks, &channel, JobKind::Processing, job.run(token.clone()));
            }
            if let Some(job) = set.retention.filter(|r| r.is_active()) {
                spawn(&mut tasks, &channel, JobKind::Retention, job.run(token.clone()));
            }
            if let Some(job) = set.chat {
                spawn(&mut tasks, &channel, JobKind::Chat, job.run(token.clone()));
            }

            info!(channel = %channel, jobs = ?kinds, "Channel started");
        }

        Self { cancel, tasks }
    }

    /// Cancel everything and wait up to `timeout` for jobs to leave their
    /// state consistent; stragglers are aborted.
    pub async fn shutdown(mut self, timeout: Duration) -> ShutdownReport {
        let mut report = ShutdownReport {
            total_tasks: self.tasks.len(),
            ..Default::default()
        };
        info!(tasks = report.total_tasks, ?timeout, "Shutting down channel jobs");
        self.cancel.cancel();

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    report.forced_terminations = self.tasks.len();
                    warn!(remaining = report.forced_terminations, "Shutdown timeout reached, aborting jobs");
                    self.tasks.abort_all();
                    while self.tasks.join_next().await.is_some() {}
                    break;
                }
                joined = self.tasks.join_next() => match joined {
                    Some(Ok(id)) => {
                        debug!(task = %id, "Job stopped");
                        report.graceful_stops += 1;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Job task ended abnormally");
                        report.crashed += 1;
                    }
                    None => break,
                },
            }
        }

        info!(
            graceful = report.graceful_stops,
            crashed = report.crashed,
            forced = report.forced_terminations,
            "Shutdown complete"
        );
        report
    }
}

fn spawn<F>(tasks: &mut JoinSet<TaskId>, channel: &str, kind: JobKind, job: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let id = TaskId {
        channel: channel.to_string(),
        kind,
    };
    tasks.spawn(async move {
        job.await;
        id
    });
}
