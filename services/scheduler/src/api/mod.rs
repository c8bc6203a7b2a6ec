//! Orchestration API access.
//!
//! [`CoreApi`] is the narrow surface the scheduler needs: read an event, ask
//! for a Worker or Job to be started, and enumerate projects.

mod client;
mod types;

use async_trait::async_trait;
use brig_id::{EventId, JobName};
use thiserror::Error;

pub use client::ApiClient;
pub use types::*;

/// Orchestration API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed to decode API response: {0}")]
    Decode(String),
}

/// Orchestration API operations used by the scheduler.
#[async_trait]
pub trait CoreApi: Send + Sync {
    /// Fetch an event, including its Worker and Jobs.
    async fn get_event(&self, id: &EventId) -> Result<Event, ApiError>;

    /// Ask the API to start the Worker for an event.
    async fn start_worker(&self, id: &EventId) -> Result<(), ApiError>;

    /// Ask the API to start one Job of an event's Worker.
    async fn start_job(&self, id: &EventId, job: &JobName) -> Result<(), ApiError>;

    /// List every project, following pagination to the end.
    async fn list_projects(&self) -> Result<Vec<Project>, ApiError>;
}
