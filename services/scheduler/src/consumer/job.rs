//! Job queue handling.
//!
//! Messages on `jobs.<project>` carry `<eventID>:<jobName>`.

use std::sync::Arc;

use async_trait::async_trait;
use brig_id::{EventId, JobName, ProjectId};
use tracing::{debug, error, info, warn};

use super::{Disposition, MessageHandler};
use crate::api::{CoreApi, JobPhase};

pub struct JobHandler {
    api: Arc<dyn CoreApi>,
}

impl JobHandler {
    pub fn new(api: Arc<dyn CoreApi>) -> Self {
        Self { api }
    }
}

/// Split a job message into its event ID and job name.
pub(crate) fn parse_job_message(body: &str) -> Option<(EventId, JobName)> {
    let mut tokens = body.split(':');
    let (event, job) = match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(event), Some(job), None) => (event, job),
        _ => return None,
    };
    Some((EventId::parse(event).ok()?, JobName::parse(job).ok()?))
}

#[async_trait]
impl MessageHandler for JobHandler {
    type Work = (EventId, JobName);

    fn queue_name(&self, project: &ProjectId) -> String {
        format!("jobs.{project}")
    }

    async fn inspect(&self, project: &ProjectId, body: &str) -> Disposition<Self::Work> {
        let Some((event_id, job)) = parse_job_message(body) else {
            warn!(project_id = %project, body, "Invalid message on job queue");
            return Disposition::Discard;
        };

        let event = match self.api.get_event(&event_id).await {
            Ok(event) => event,
            Err(e) => {
                error!(
                    project_id = %project,
                    event_id = %event_id,
                    job = %job,
                    error = %e,
                    "Failed to fetch event"
                );
                return Disposition::Discard;
            }
        };

        let Some(found) = event.job(&job) else {
            warn!(
                project_id = %project,
                event_id = %event_id,
                job = %job,
                "No such job for event"
            );
            return Disposition::Discard;
        };

        let phase = found.status.phase;
        if phase != JobPhase::Pending {
            debug!(
                project_id = %project,
                event_id = %event_id,
                job = %job,
                phase = ?phase,
                "Job is not pending, discarding"
            );
            return Disposition::Discard;
        }

        Disposition::Dispatch((event_id, job))
    }

    async fn dispatch(&self, project: &ProjectId, (event_id, job): Self::Work) {
        match self.api.start_job(&event_id, &job).await {
            Ok(()) => info!(project_id = %project, event_id = %event_id, job = %job, "Started job"),
            Err(e) => error!(
                project_id = %project,
                event_id = %event_id,
                job = %job,
                error = %e,
                "Failed to start job"
            ),
        }
    }
}
