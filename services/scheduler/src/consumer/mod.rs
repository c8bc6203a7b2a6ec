//! Worker and Job consumer loops.
//!
//! A [`ConsumerLoop`] reads one project's queue and, for each message, asks
//! its [`MessageHandler`] whether the message describes work that still needs
//! starting. Messages that don't are acknowledged straight away. Messages
//! that do wait for an admission before the work is dispatched.
//!
//! ```text
//! Connecting ──ok──▶ Consuming ──read error──▶ Reconnecting ──▶ Connecting
//!     │                  │
//!   fatal            cancelled
//!     ▼                  ▼
//!  Exiting ◀─────────────┘
//! ```
//!
//! A message is acknowledged only once it has been discarded or dispatched.
//! Cancellation while waiting for admission leaves it unacknowledged so the
//! broker redelivers it.

mod job;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use brig_id::ProjectId;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use job::JobHandler;
pub use worker::WorkerHandler;

use crate::capacity::AdmissionSignal;
use crate::error::{ErrorSender, SchedulerError};
use crate::queue::{QueueMessage, QueueReader, QueueReaderFactory};

/// What to do with a message.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition<W> {
    /// Nothing to start; acknowledge.
    Discard,
    /// Wait for capacity, then start `W`.
    Dispatch(W),
}

/// Interprets messages on one kind of queue.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    type Work: Send;

    /// Queue carrying this kind of message for `project`.
    fn queue_name(&self, project: &ProjectId) -> String;

    /// Decide whether a message still describes work to start.
    async fn inspect(&self, project: &ProjectId, body: &str) -> Disposition<Self::Work>;

    /// Start admitted work. Failures are logged, never propagated.
    async fn dispatch(&self, project: &ProjectId, work: Self::Work);
}

/// Consumes one project's queue for one kind of workload.
pub struct ConsumerLoop<H> {
    project: ProjectId,
    handler: H,
    queues: Arc<dyn QueueReaderFactory>,
    admission: AdmissionSignal,
    close_timeout: Duration,
    errors: ErrorSender,
}

enum Step<T> {
    Cancelled,
    Ready(T),
}

async fn or_cancelled<F: std::future::Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Step<F::Output> {
    tokio::select! {
        _ = cancel.cancelled() => Step::Cancelled,
        out = fut => Step::Ready(out),
    }
}

impl<H: MessageHandler> ConsumerLoop<H> {
    pub fn new(
        project: ProjectId,
        handler: H,
        queues: Arc<dyn QueueReaderFactory>,
        admission: AdmissionSignal,
        close_timeout: Duration,
        errors: ErrorSender,
    ) -> Self {
        Self {
            project,
            handler,
            queues,
            admission,
            close_timeout,
            errors,
        }
    }

    /// Consume until cancelled or the queue becomes unreachable.
    pub async fn run(self, cancel: CancellationToken) {
        let queue = self.handler.queue_name(&self.project);
        debug!(project_id = %self.project, queue = %queue, "Starting consumer loop");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let opened = match or_cancelled(&cancel, self.queues.new_reader(&queue)).await {
                Step::Cancelled => break,
                Step::Ready(opened) => opened,
            };
            let mut reader = match opened {
                Ok(reader) => reader,
                Err(e) => {
                    error!(
                        project_id = %self.project,
                        queue = %queue,
                        error = %e,
                        "Unable to open queue reader"
                    );
                    self.errors.report(SchedulerError::QueueConnect {
                        queue: queue.clone(),
                        source: e,
                    });
                    break;
                }
            };

            let reconnect = self.consume(&mut *reader, &queue, &cancel).await;
            self.close_reader(&mut *reader, &queue).await;
            if !reconnect {
                break;
            }
        }

        debug!(project_id = %self.project, queue = %queue, "Consumer loop exited");
    }

    /// Process messages until the reader fails (returns true) or the loop is
    /// cancelled (returns false).
    async fn consume(
        &self,
        reader: &mut dyn QueueReader,
        queue: &str,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            let msg = match or_cancelled(cancel, reader.read()).await {
                Step::Cancelled => return false,
                Step::Ready(Ok(msg)) => msg,
                Step::Ready(Err(e)) => {
                    warn!(
                        project_id = %self.project,
                        queue = %queue,
                        error = %e,
                        "Queue read failed, reconnecting"
                    );
                    return true;
                }
            };

            let inspected = self.handler.inspect(&self.project, msg.body());
            let disposition = match or_cancelled(cancel, inspected).await {
                Step::Cancelled => return false,
                Step::Ready(d) => d,
            };

            let work = match disposition {
                Disposition::Discard => {
                    self.ack(msg).await;
                    continue;
                }
                Disposition::Dispatch(work) => work,
            };

            if let Step::Cancelled = or_cancelled(cancel, self.admission.wait()).await {
                info!(
                    project_id = %self.project,
                    queue = %queue,
                    "Cancelled while waiting for capacity, leaving message for redelivery"
                );
                return false;
            }

            self.handler.dispatch(&self.project, work).await;
            self.ack(msg).await;
        }
    }

    async fn ack(&self, msg: QueueMessage) {
        if let Err(e) = msg.ack().await {
            warn!(project_id = %self.project, error = %e, "Failed to acknowledge message");
        }
    }

    async fn close_reader(&self, reader: &mut dyn QueueReader, queue: &str) {
        match tokio::time::timeout(self.close_timeout, reader.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                project_id = %self.project,
                queue = %queue,
                error = %e,
                "Error closing queue reader"
            ),
            Err(_) => warn!(
                project_id = %self.project,
                queue = %queue,
                "Timed out closing queue reader"
            ),
        }
    }
}
