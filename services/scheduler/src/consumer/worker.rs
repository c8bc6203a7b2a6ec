//! Worker queue handling.
//!
//! Messages on `workers.<project>` carry a bare event ID.

use std::sync::Arc;

use async_trait::async_trait;
use brig_id::{EventId, ProjectId};
use tracing::{debug, error, info, warn};

use super::{Disposition, MessageHandler};
use crate::api::{CoreApi, WorkerPhase};

pub struct WorkerHandler {
    api: Arc<dyn CoreApi>,
}

impl WorkerHandler {
    pub fn new(api: Arc<dyn CoreApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl MessageHandler for WorkerHandler {
    type Work = EventId;

    fn queue_name(&self, project: &ProjectId) -> String {
        format!("workers.{project}")
    }

    async fn inspect(&self, project: &ProjectId, body: &str) -> Disposition<EventId> {
        let event_id = match EventId::parse(body) {
            Ok(id) => id,
            Err(e) => {
                warn!(project_id = %project, body, error = %e, "Invalid message on worker queue");
                return Disposition::Discard;
            }
        };

        let event = match self.api.get_event(&event_id).await {
            Ok(event) => event,
            Err(e) => {
                error!(
                    project_id = %project,
                    event_id = %event_id,
                    error = %e,
                    "Failed to fetch event"
                );
                return Disposition::Discard;
            }
        };

        let phase = event.worker_phase();
        if phase != WorkerPhase::Pending {
            debug!(
                project_id = %project,
                event_id = %event_id,
                phase = ?phase,
                "Worker is not pending, discarding"
            );
            return Disposition::Discard;
        }

        Disposition::Dispatch(event_id)
    }

    async fn dispatch(&self, project: &ProjectId, event_id: EventId) {
        match self.api.start_worker(&event_id).await {
            Ok(()) => info!(project_id = %project, event_id = %event_id, "Started worker"),
            Err(e) => error!(
                project_id = %project,
                event_id = %event_id,
                error = %e,
                "Failed to start worker"
            ),
        }
    }
}
