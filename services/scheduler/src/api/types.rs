//! Orchestration API resources.
//!
//! Only the fields the scheduler reads are modelled.

use std::collections::HashMap;

use brig_id::{EventId, JobName, ProjectId};
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a Worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerPhase {
    Pending,
    Starting,
    Running,
    Succeeded,
    Failed,
    Aborted,
    Canceled,
    TimedOut,
    SchedulingFailed,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Lifecycle phase of a Job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPhase {
    Pending,
    Starting,
    Running,
    Succeeded,
    Failed,
    Aborted,
    Canceled,
    TimedOut,
    SchedulingFailed,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMeta {
    pub id: ProjectId,
}

/// A tenant project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub metadata: ProjectMeta,
}

impl Project {
    pub fn id(&self) -> &ProjectId {
        &self.metadata.id
    }
}

/// Pagination metadata on list responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListMeta {
    #[serde(default, rename = "continue", skip_serializing_if = "Option::is_none")]
    pub continue_token: Option<String>,
}

/// One page of projects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectList {
    #[serde(default)]
    pub metadata: ListMeta,

    #[serde(default)]
    pub items: Vec<Project>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMeta {
    pub id: EventId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerStatus {
    #[serde(default)]
    pub phase: WorkerPhase,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobStatus {
    #[serde(default)]
    pub phase: JobPhase,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub status: JobStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Worker {
    #[serde(default)]
    pub status: WorkerStatus,

    /// Jobs spawned by the Worker, keyed by job name.
    #[serde(default)]
    pub jobs: HashMap<String, Job>,
}

/// An event and the state of the Worker handling it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub metadata: EventMeta,

    #[serde(rename = "projectID", default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,

    #[serde(default)]
    pub worker: Worker,
}

impl Event {
    pub fn id(&self) -> &EventId {
        &self.metadata.id
    }

    pub fn worker_phase(&self) -> WorkerPhase {
        self.worker.status.phase
    }

    /// Looks up a job spawned by this event's Worker.
    pub fn job(&self, name: &JobName) -> Option<&Job> {
        self.worker.jobs.get(name.as_str())
    }
}
