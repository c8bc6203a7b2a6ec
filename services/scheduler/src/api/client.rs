//! REST client for the orchestration API.

use std::time::Duration;

use async_trait::async_trait;
use brig_id::{EventId, JobName};
use serde::de::DeserializeOwned;
use tracing::{debug, error};

use super::{ApiError, CoreApi, Event, Project, ProjectList};
use crate::config::ApiConfig;

/// Orchestration API client.
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl ApiClient {
    /// Create a new API client.
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(config.ignore_cert_warnings)
            .build()?;

        Ok(Self {
            client,
            base_url: config.address.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn check(
        response: reqwest::Response,
        what: &str,
    ) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound(what.to_string()));
        }
        let body = response.text().await.unwrap_or_default();
        error!(status = %status, body = %body, what, "API request failed");
        Err(ApiError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl CoreApi for ApiClient {
    async fn get_event(&self, id: &EventId) -> Result<Event, ApiError> {
        debug!(event_id = %id, "Fetching event");
        let response = self
            .client
            .get(self.url(&format!("v2/events/{id}")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let response = Self::check(response, &format!("event {id}")).await?;
        Self::decode(response).await
    }

    async fn start_worker(&self, id: &EventId) -> Result<(), ApiError> {
        debug!(event_id = %id, "Starting worker");
        let response = self
            .client
            .put(self.url(&format!("v2/events/{id}/worker/start")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::check(response, &format!("event {id}")).await?;
        Ok(())
    }

    async fn start_job(&self, id: &EventId, job: &JobName) -> Result<(), ApiError> {
        debug!(event_id = %id, job = %job, "Starting job");
        let response = self
            .client
            .put(self.url(&format!("v2/events/{id}/worker/jobs/{job}/start")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::check(response, &format!("job {job} of event {id}")).await?;
        Ok(())
    }

    async fn list_projects(&self) -> Result<Vec<Project>, ApiError> {
        let mut projects = Vec::new();
        let mut continue_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .get(self.url("v2/projects"))
                .bearer_auth(&self.token);
            if let Some(token) = &continue_token {
                request = request.query(&[("continue", token)]);
            }

            let response = Self::check(request.send().await?, "projects").await?;
            let page: ProjectList = Self::decode(response).await?;
            projects.extend(page.items);

            match page.metadata.continue_token.filter(|t| !t.is_empty()) {
                Some(token) => continue_token = Some(token),
                None => break,
            }
        }

        debug!(count = projects.len(), "Listed projects");
        Ok(projects)
    }
}
