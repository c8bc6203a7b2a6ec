//! Project reconciliation.
//!
//! The [`ProjectLoopManager`] keeps exactly one Worker consumer loop and one
//! Job consumer loop running per known project. It lists projects
//! immediately and then on a fixed interval, starting loops for new projects
//! and cancelling loops for projects that have disappeared.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use brig_id::ProjectId;
use brig_reconcile::diff_keys;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument};

use crate::api::{ApiError, CoreApi, Project};
use crate::capacity::AdmissionSignal;
use crate::consumer::{ConsumerLoop, JobHandler, WorkerHandler};
use crate::error::{ErrorSender, SchedulerError};
use crate::queue::QueueReaderFactory;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub started: usize,
    pub stopped: usize,
    pub active: usize,
}

/// Everything a consumer loop needs, shared by all projects.
#[derive(Clone)]
pub struct ConsumerContext {
    pub api: Arc<dyn CoreApi>,
    pub queues: Arc<dyn QueueReaderFactory>,
    pub worker_admission: AdmissionSignal,
    pub job_admission: AdmissionSignal,
    pub reader_close_timeout: Duration,
    pub errors: ErrorSender,
    pub tasks: TaskTracker,
}

impl ConsumerContext {
    fn spawn_loops(&self, project: &ProjectId, cancel: CancellationToken) {
        let workers = ConsumerLoop::new(
            project.clone(),
            WorkerHandler::new(Arc::clone(&self.api)),
            Arc::clone(&self.queues),
            self.worker_admission.clone(),
            self.reader_close_timeout,
            self.errors.clone(),
        );
        let jobs = ConsumerLoop::new(
            project.clone(),
            JobHandler::new(Arc::clone(&self.api)),
            Arc::clone(&self.queues),
            self.job_admission.clone(),
            self.reader_close_timeout,
            self.errors.clone(),
        );
        self.tasks.spawn(workers.run(cancel.clone()));
        self.tasks.spawn(jobs.run(cancel));
    }
}

/// Starts and stops per-project consumer loops.
pub struct ProjectLoopManager {
    consumers: ConsumerContext,
    interval: Duration,
    registry: HashMap<ProjectId, CancellationToken>,
}

impl ProjectLoopManager {
    pub fn new(consumers: ConsumerContext, interval: Duration) -> Self {
        Self {
            consumers,
            interval,
            registry: HashMap::new(),
        }
    }

    /// Projects that currently have consumer loops.
    pub fn active_projects(&self) -> Vec<ProjectId> {
        let mut ids: Vec<_> = self.registry.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Reconcile until cancelled or project listing fails.
    #[instrument(skip_all)]
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Starting project loop manager");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sync(&cancel).await {
                        error!(error = %e, "Failed to list projects");
                        self.consumers.errors.report(SchedulerError::ProjectList(e));
                        break;
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("Project loop manager shutting down");
                    break;
                }
            }
        }
    }

    /// List projects and reconcile against them.
    pub async fn sync(&mut self, parent: &CancellationToken) -> Result<ReconcileStats, ApiError> {
        let projects = self.consumers.api.list_projects().await?;
        Ok(self.reconcile(&projects, parent))
    }

    /// Start loops for new projects and stop loops for vanished ones.
    pub fn reconcile(
        &mut self,
        projects: &[Project],
        parent: &CancellationToken,
    ) -> ReconcileStats {
        let current: Vec<ProjectId> = projects.iter().map(|p| p.id().clone()).collect();
        let diff = diff_keys(&current, self.registry.keys());

        for project in &diff.removed {
            if let Some(token) = self.registry.remove(project) {
                token.cancel();
                info!(project_id = %project, "Stopped consumer loops for removed project");
            }
        }

        for project in &diff.added {
            let token = parent.child_token();
            self.consumers.spawn_loops(project, token.clone());
            self.registry.insert(project.clone(), token);
            info!(project_id = %project, "Started consumer loops for project");
        }

        let stats = ReconcileStats {
            started: diff.added.len(),
            stopped: diff.removed.len(),
            active: self.registry.len(),
        };
        if stats.started > 0 || stats.stopped > 0 {
            debug!(
                started = stats.started,
                stopped = stats.stopped,
                active = stats.active,
                "Reconciled projects"
            );
        }
        stats
    }
}
