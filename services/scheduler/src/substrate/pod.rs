//! Pod model.
//!
//! Only the subset of the Kubernetes pod object the scheduler consumes is
//! modelled; unknown fields are ignored on decode.

use std::collections::BTreeMap;

use brig_id::NamespacedPodName;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Label carrying the workload component of a pod.
pub const COMPONENT_LABEL: &str = "brigade.sh/component";

/// The two kinds of workload pods the scheduler tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PodKind {
    Worker,
    Job,
}

impl PodKind {
    pub const ALL: [PodKind; 2] = [PodKind::Worker, PodKind::Job];

    /// Returns the component label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::Job => "job",
        }
    }

    /// Label selector matching every pod of this kind.
    pub fn label_selector(&self) -> String {
        format!("{}={}", COMPONENT_LABEL, self.as_str())
    }
}

impl std::fmt::Display for PodKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pod lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[serde(other)]
    Unknown,
}

impl PodPhase {
    /// Whether the pod has finished running.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// A pod as reported by the substrate.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pod {
    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub status: Option<PodStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub resource_version: Option<String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(default)]
    pub phase: Option<PodPhase>,

    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerStatus {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub state: Option<ContainerState>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerState {
    #[serde(default)]
    pub terminated: Option<ContainerStateTerminated>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStateTerminated {
    #[serde(default)]
    pub exit_code: i32,

    #[serde(default)]
    pub reason: Option<String>,

    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Pod {
    /// Cluster-wide identity of this pod.
    pub fn key(&self) -> NamespacedPodName {
        NamespacedPodName::new(&self.metadata.namespace, &self.metadata.name)
    }

    /// Phase, treating a missing status as `Unknown`.
    pub fn phase(&self) -> PodPhase {
        self.status
            .as_ref()
            .and_then(|s| s.phase)
            .unwrap_or(PodPhase::Unknown)
    }

    /// Whether deletion of this pod has been requested.
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether this pod currently consumes scheduling capacity.
    ///
    /// Pods being deleted and pods that have finished do not; everything
    /// else (including `Unknown`) does.
    pub fn consumes_capacity(&self) -> bool {
        !self.is_being_deleted() && !self.phase().is_terminal()
    }

    /// Terminated state of the primary (first) container, if it has exited.
    pub fn primary_container_terminated(&self) -> Option<&ContainerStateTerminated> {
        self.status
            .as_ref()?
            .container_statuses
            .first()?
            .state
            .as_ref()?
            .terminated
            .as_ref()
    }
}

/// Metadata of a list response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMeta {
    #[serde(default)]
    pub resource_version: Option<String>,

    #[serde(default, rename = "continue")]
    pub continue_token: Option<String>,
}

/// A list of pods.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodList {
    #[serde(default)]
    pub metadata: ListMeta,

    #[serde(default)]
    pub items: Vec<Pod>,
}
