//! Shared fakes for scheduler integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use brig_id::{EventId, JobName, NamespacedPodName, ProjectId};
use brig_scheduler::api::{
    ApiError, CoreApi, Event, EventMeta, Job, JobPhase, JobStatus, Project, ProjectMeta, Worker,
    WorkerPhase, WorkerStatus,
};
use brig_scheduler::substrate::pod::{ListMeta, ObjectMeta, PodStatus};
use brig_scheduler::substrate::{
    Pod, PodKind, PodList, PodPhase, PodSource, SubstrateError, WatchEvent, WatchStream,
};
use brig_scheduler::SchedulerConfig;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

// =============================================================================
// Orchestration API
// =============================================================================

#[derive(Default)]
struct ApiState {
    events: HashMap<String, Event>,
    projects: Vec<String>,
    fail_listing: bool,
    fail_starts: bool,
    started_workers: Vec<String>,
    started_jobs: Vec<(String, String)>,
    list_calls: usize,
    substrate: Option<Arc<FakePods>>,
}

/// In-memory orchestration API. Starting a workload moves it to `STARTING`,
/// as the real API does.
#[derive(Default)]
pub struct FakeApi {
    state: Mutex<ApiState>,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_event(&self, id: &str, worker: WorkerPhase, jobs: &[(&str, JobPhase)]) {
        let event = Event {
            metadata: EventMeta {
                id: EventId::parse(id).unwrap(),
            },
            project_id: None,
            worker: Worker {
                status: WorkerStatus { phase: worker },
                jobs: jobs
                    .iter()
                    .map(|(name, phase)| {
                        (
                            name.to_string(),
                            Job {
                                status: JobStatus { phase: *phase },
                            },
                        )
                    })
                    .collect(),
            },
        };
        self.state.lock().events.insert(id.to_string(), event);
    }

    pub fn set_projects(&self, ids: &[&str]) {
        self.state.lock().projects = ids.iter().map(|s| s.to_string()).collect();
    }

    pub fn fail_listing(&self, fail: bool) {
        self.state.lock().fail_listing = fail;
    }

    /// Create a Pending pod in `pods` for every workload started.
    pub fn create_pods_in(&self, pods: Arc<FakePods>) {
        self.state.lock().substrate = Some(pods);
    }

    pub fn fail_starts(&self, fail: bool) {
        self.state.lock().fail_starts = fail;
    }

    pub fn started_workers(&self) -> Vec<String> {
        self.state.lock().started_workers.clone()
    }

    pub fn started_jobs(&self) -> Vec<(String, String)> {
        self.state.lock().started_jobs.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().list_calls
    }
}

#[async_trait]
impl CoreApi for FakeApi {
    async fn get_event(&self, id: &EventId) -> Result<Event, ApiError> {
        self.state
            .lock()
            .events
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("event {id}")))
    }

    async fn start_worker(&self, id: &EventId) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.started_workers.push(id.to_string());
        if state.fail_starts {
            return Err(ApiError::Status {
                status: 500,
                body: "boom".into(),
            });
        }
        if let Some(event) = state.events.get_mut(id.as_str()) {
            event.worker.status.phase = WorkerPhase::Starting;
        }
        if let Some(pods) = &state.substrate {
            pods.put(
                PodKind::Worker,
                pod("brigade", &format!("worker-{id}"), PodPhase::Pending),
            );
        }
        Ok(())
    }

    async fn start_job(&self, id: &EventId, job: &JobName) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.started_jobs.push((id.to_string(), job.to_string()));
        if state.fail_starts {
            return Err(ApiError::Status {
                status: 500,
                body: "boom".into(),
            });
        }
        if let Some(found) = state
            .events
            .get_mut(id.as_str())
            .and_then(|e| e.worker.jobs.get_mut(job.as_str()))
        {
            found.status.phase = JobPhase::Starting;
        }
        if let Some(pods) = &state.substrate {
            pods.put(
                PodKind::Job,
                pod("brigade", &format!("job-{id}-{job}"), PodPhase::Pending),
            );
        }
        Ok(())
    }

    async fn list_projects(&self) -> Result<Vec<Project>, ApiError> {
        let mut state = self.state.lock();
        state.list_calls += 1;
        if state.fail_listing {
            return Err(ApiError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }
        Ok(state
            .projects
            .iter()
            .map(|id| Project {
                metadata: ProjectMeta {
                    id: ProjectId::parse(id).unwrap(),
                },
            })
            .collect())
    }
}

// =============================================================================
// Substrate
// =============================================================================

type WatchSender = mpsc::UnboundedSender<Result<WatchEvent, SubstrateError>>;

#[derive(Default)]
struct PodsState {
    pods: HashMap<PodKind, HashMap<NamespacedPodName, Pod>>,
    watchers: Vec<(PodKind, WatchSender)>,
    resource_version: u64,
    fail_listing: bool,
    deleted: Vec<NamespacedPodName>,
    list_calls: usize,
}

impl PodsState {
    fn bump(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn broadcast(&mut self, kind: PodKind, event: WatchEvent) {
        self.watchers
            .retain(|(k, tx)| *k != kind || tx.send(Ok(event.clone())).is_ok());
    }
}

/// In-memory substrate. Mutations are pushed to open watches.
#[derive(Default)]
pub struct FakePods {
    state: Mutex<PodsState>,
}

fn kind_of(selector: &str) -> PodKind {
    PodKind::ALL
        .into_iter()
        .find(|k| k.label_selector() == selector)
        .unwrap_or_else(|| panic!("unexpected selector {selector}"))
}

impl FakePods {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create or update a pod.
    pub fn put(&self, kind: PodKind, mut pod: Pod) {
        let mut state = self.state.lock();
        pod.metadata.resource_version = Some(state.bump());
        let existed = state
            .pods
            .entry(kind)
            .or_default()
            .insert(pod.key(), pod.clone())
            .is_some();
        let event = if existed {
            WatchEvent::Modified(pod)
        } else {
            WatchEvent::Added(pod)
        };
        state.broadcast(kind, event);
    }

    /// Remove a pod as if the substrate had finished deleting it.
    pub fn remove(&self, kind: PodKind, key: &NamespacedPodName) {
        let mut state = self.state.lock();
        if let Some(pod) = state.pods.entry(kind).or_default().remove(key) {
            state.bump();
            state.broadcast(kind, WatchEvent::Deleted(pod));
        }
    }

    /// Remove a pod without telling open watches.
    pub fn remove_silently(&self, kind: PodKind, key: &NamespacedPodName) {
        self.state.lock().pods.entry(kind).or_default().remove(key);
    }

    /// End every open watch.
    pub fn end_watches(&self) {
        self.state.lock().watchers.clear();
    }

    /// Fail the next watch streams with an expired resource version.
    pub fn expire_watches(&self) {
        let mut state = self.state.lock();
        for (_, tx) in state.watchers.drain(..) {
            let _ = tx.send(Err(SubstrateError::Watch {
                code: 410,
                message: "too old resource version".into(),
            }));
        }
    }

    pub fn fail_listing(&self, fail: bool) {
        self.state.lock().fail_listing = fail;
    }

    pub fn deleted(&self) -> Vec<NamespacedPodName> {
        self.state.lock().deleted.clone()
    }

    pub fn watch_count(&self, kind: PodKind) -> usize {
        let mut state = self.state.lock();
        state.watchers.retain(|(_, tx)| !tx.is_closed());
        state.watchers.iter().filter(|(k, _)| *k == kind).count()
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().list_calls
    }
}

#[async_trait]
impl PodSource for FakePods {
    async fn list(&self, label_selector: &str) -> Result<PodList, SubstrateError> {
        let kind = kind_of(label_selector);
        let mut state = self.state.lock();
        state.list_calls += 1;
        if state.fail_listing {
            return Err(SubstrateError::Status {
                status: 500,
                body: "list failed".into(),
            });
        }
        let items = state
            .pods
            .get(&kind)
            .map(|pods| pods.values().cloned().collect())
            .unwrap_or_default();
        Ok(PodList {
            metadata: ListMeta {
                resource_version: Some(state.resource_version.to_string()),
                continue_token: None,
            },
            items,
        })
    }

    async fn watch(
        &self,
        label_selector: &str,
        _resource_version: &str,
    ) -> Result<WatchStream, SubstrateError> {
        let kind = kind_of(label_selector);
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().watchers.push((kind, tx));
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn delete(&self, pod: &NamespacedPodName) -> Result<(), SubstrateError> {
        let mut state = self.state.lock();
        state.deleted.push(pod.clone());
        for kind in PodKind::ALL {
            if let Some(removed) = state.pods.entry(kind).or_default().remove(pod) {
                state.bump();
                state.broadcast(kind, WatchEvent::Deleted(removed));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

pub fn pod(namespace: &str, name: &str, phase: PodPhase) -> Pod {
    Pod {
        metadata: ObjectMeta {
            namespace: namespace.to_string(),
            name: name.to_string(),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some(phase),
            ..Default::default()
        }),
    }
}

pub fn key(namespace: &str, name: &str) -> NamespacedPodName {
    NamespacedPodName::new(namespace, name)
}

pub fn project(id: &str) -> ProjectId {
    ProjectId::parse(id).unwrap()
}

/// Scheduler settings scaled down to milliseconds.
pub fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent_workers: 2,
        max_concurrent_jobs: 2,
        capacity_interval: Duration::from_millis(20),
        project_sync_interval: Duration::from_millis(50),
        pod_deletion_delay: Duration::from_millis(30),
        reader_close_timeout: Duration::from_millis(200),
        shutdown_grace: Duration::from_millis(500),
        watch_restart_backoff: Duration::from_millis(10),
    }
}

/// Poll `check` until it holds, panicking after a few seconds.
pub async fn eventually<F>(what: &str, check: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Assert `check` keeps holding for a short while.
pub async fn consistently<F>(what: &str, check: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(100);
    while tokio::time::Instant::now() < deadline {
        assert!(check(), "expected {what} to keep holding");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
