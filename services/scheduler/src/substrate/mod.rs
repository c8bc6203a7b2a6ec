//! Container substrate access.
//!
//! The scheduler only needs three things from the substrate: list pods by
//! label, watch them for changes, and delete finished ones. [`PodSource`] is
//! the seam; [`kubernetes::KubeClient`] talks to a real cluster.

pub mod kubernetes;
pub mod pod;

use async_trait::async_trait;
use brig_id::NamespacedPodName;
use futures_util::stream::BoxStream;
use thiserror::Error;

pub use kubernetes::KubeClient;
pub use pod::{Pod, PodKind, PodList, PodPhase};

/// Substrate errors.
#[derive(Debug, Error)]
pub enum SubstrateError {
    #[error("substrate request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("substrate returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode substrate response: {0}")]
    Decode(String),

    #[error("watch failed with code {code}: {message}")]
    Watch { code: u16, message: String },

    #[error("invalid substrate configuration: {0}")]
    Config(String),
}

impl SubstrateError {
    /// Whether the requested resource version is too old to resume from.
    pub fn is_gone(&self) -> bool {
        matches!(
            self,
            Self::Status { status: 410, .. } | Self::Watch { code: 410, .. }
        )
    }
}

/// A change observed on a watch.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(Pod),
    Modified(Pod),
    Deleted(Pod),
    /// Progress marker carrying only a resource version.
    Bookmark(String),
}

/// Stream of watch events. The stream ends when the server closes the watch.
pub type WatchStream = BoxStream<'static, Result<WatchEvent, SubstrateError>>;

/// Pod access on the container substrate.
#[async_trait]
pub trait PodSource: Send + Sync {
    /// List all pods (in every namespace) matching a label selector.
    async fn list(&self, label_selector: &str) -> Result<PodList, SubstrateError>;

    /// Watch pods matching a label selector, starting after `resource_version`.
    async fn watch(
        &self,
        label_selector: &str,
        resource_version: &str,
    ) -> Result<WatchStream, SubstrateError>;

    /// Delete a pod. Deleting a pod that no longer exists succeeds.
    async fn delete(&self, pod: &NamespacedPodName) -> Result<(), SubstrateError>;
}
