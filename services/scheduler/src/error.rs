//! Fatal scheduler errors and the channel they travel on.

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::api::ApiError;
use crate::queue::QueueError;
use crate::substrate::{PodKind, SubstrateError};

/// Errors that stop the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("initial {kind} pod sync failed: {source}")]
    InitialSync {
        kind: PodKind,
        #[source]
        source: SubstrateError,
    },

    #[error("unable to open reader on queue {queue}: {source}")]
    QueueConnect {
        queue: String,
        #[source]
        source: QueueError,
    },

    #[error("unable to list projects: {0}")]
    ProjectList(#[from] ApiError),
}

/// Sending half of the fatal error channel.
///
/// Only the first error is kept; later ones are dropped since the scheduler
/// is already shutting down by then.
#[derive(Clone)]
pub struct ErrorSender(mpsc::Sender<SchedulerError>);

impl ErrorSender {
    pub fn report(&self, err: SchedulerError) {
        if let Err(e) = self.0.try_send(err) {
            debug!(error = %e.into_inner(), "Dropping fatal error, one is already pending");
        }
    }
}

/// Create the fatal error channel.
pub fn error_channel() -> (ErrorSender, mpsc::Receiver<SchedulerError>) {
    let (tx, rx) = mpsc::channel(1);
    (ErrorSender(tx), rx)
}
