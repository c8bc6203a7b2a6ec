//! Top-level scheduler.
//!
//! Wires the synchronizers, capacity managers and project loop manager
//! together under one cancellation root and task tracker:
//!
//! ```text
//! Scheduler
//! ├── PodSynchronizer(worker)   ── PodTracker ──┐
//! ├── PodSynchronizer(job)      ────────────────┤
//! ├── CapacityManager(worker)   ◀── count ──────┤ ──▶ AdmissionSignal(worker)
//! ├── CapacityManager(job)      ◀── count ──────┘ ──▶ AdmissionSignal(job)
//! └── ProjectLoopManager
//!     └── per project: ConsumerLoop(worker), ConsumerLoop(job)
//! ```
//!
//! The first fatal error, or cancellation of the caller's token, cancels
//! everything. Shutdown then waits a bounded grace period for tasks to
//! finish before returning.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::api::CoreApi;
use crate::capacity::{AdmissionSignal, CapacityManager};
use crate::config::SchedulerConfig;
use crate::error::{error_channel, SchedulerError};
use crate::projects::{ConsumerContext, ProjectLoopManager};
use crate::queue::QueueReaderFactory;
use crate::substrate::{PodKind, PodSource};
use crate::sync::{PodSynchronizer, PodTracker};

/// The scheduler.
pub struct Scheduler {
    config: SchedulerConfig,
    api: Arc<dyn CoreApi>,
    pods: Arc<dyn PodSource>,
    queues: Arc<dyn QueueReaderFactory>,
    tracker: Arc<PodTracker>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        api: Arc<dyn CoreApi>,
        pods: Arc<dyn PodSource>,
        queues: Arc<dyn QueueReaderFactory>,
    ) -> Self {
        Self {
            config,
            api,
            pods,
            queues,
            tracker: Arc::new(PodTracker::new()),
        }
    }

    /// Shared view of capacity-consuming pods.
    pub fn tracker(&self) -> Arc<PodTracker> {
        Arc::clone(&self.tracker)
    }

    /// Run until `shutdown` is cancelled or a fatal error occurs.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), SchedulerError> {
        let root = shutdown.child_token();
        let tasks = TaskTracker::new();

        let result = self.run_inner(&root, &tasks).await;

        root.cancel();
        tasks.close();
        if tokio::time::timeout(self.config.shutdown_grace, tasks.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = tasks.len(),
                grace_ms = self.config.shutdown_grace.as_millis() as u64,
                "Shutdown grace period elapsed with tasks still running"
            );
        }

        match &result {
            Ok(()) => info!("Scheduler stopped"),
            Err(e) => error!(error = %e, "Scheduler stopped on fatal error"),
        }
        result
    }

    async fn run_inner(
        &self,
        root: &CancellationToken,
        tasks: &TaskTracker,
    ) -> Result<(), SchedulerError> {
        let mut synchronizers = Vec::with_capacity(PodKind::ALL.len());
        for kind in PodKind::ALL {
            let mut synchronizer = PodSynchronizer::new(
                kind,
                Arc::clone(&self.pods),
                Arc::clone(&self.tracker),
                tasks.clone(),
                self.config.pod_deletion_delay,
                self.config.watch_restart_backoff,
            );
            synchronizer
                .sync_existing(root)
                .await
                .map_err(|source| SchedulerError::InitialSync { kind, source })?;
            synchronizers.push(synchronizer);
        }

        let (errors, mut fatal) = error_channel();
        let worker_admission = AdmissionSignal::new();
        let job_admission = AdmissionSignal::new();

        for synchronizer in synchronizers {
            tasks.spawn(synchronizer.run(root.clone()));
        }

        for (kind, signal, ceiling) in [
            (
                PodKind::Worker,
                worker_admission.clone(),
                self.config.max_concurrent_workers,
            ),
            (
                PodKind::Job,
                job_admission.clone(),
                self.config.max_concurrent_jobs,
            ),
        ] {
            let manager = CapacityManager::new(
                kind,
                Arc::clone(&self.tracker),
                signal,
                ceiling,
                self.config.capacity_interval,
            );
            tasks.spawn(manager.run(root.clone()));
        }

        let consumers = ConsumerContext {
            api: Arc::clone(&self.api),
            queues: Arc::clone(&self.queues),
            worker_admission,
            job_admission,
            reader_close_timeout: self.config.reader_close_timeout,
            errors,
            tasks: tasks.clone(),
        };
        let projects = ProjectLoopManager::new(consumers, self.config.project_sync_interval);
        tasks.spawn(projects.run(root.clone()));

        info!(
            workers = self.tracker.count(PodKind::Worker),
            jobs = self.tracker.count(PodKind::Job),
            "Scheduler started"
        );

        tokio::select! {
            _ = root.cancelled() => {
                info!("Shutdown requested");
                Ok(())
            }
            Some(err) = fatal.recv() => Err(err),
        }
    }
}
