//! Capacity management.
//!
//! Each [`CapacityManager`] periodically checks how many pods of its kind are
//! consuming capacity and, if below the ceiling, offers a single admission on
//! its [`AdmissionSignal`]. An offer that finds no waiting consumer is
//! abandoned; admissions never accumulate.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::substrate::PodKind;
use crate::sync::PodTracker;

/// Rendezvous hand-off between a capacity manager and waiting consumers.
#[derive(Clone, Default)]
pub struct AdmissionSignal {
    waiters: Arc<Mutex<VecDeque<oneshot::Sender<()>>>>,
}

impl AdmissionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until admitted.
    ///
    /// Cancel-safe: dropping the future withdraws the waiter.
    pub async fn wait(&self) {
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.waiters.lock();
            waiters.retain(|tx| !tx.is_closed());
            waiters.push_back(tx);
        }
        if rx.await.is_err() {
            // Senders are only dropped unsent when the signal itself goes away.
            std::future::pending::<()>().await;
        }
    }

    /// Admit one currently-waiting consumer, if there is one.
    pub fn offer(&self) -> bool {
        let mut waiters = self.waiters.lock();
        while let Some(tx) = waiters.pop_front() {
            if tx.send(()).is_ok() {
                return true;
            }
        }
        false
    }

    /// Number of consumers currently waiting.
    pub fn waiting(&self) -> usize {
        let mut waiters = self.waiters.lock();
        waiters.retain(|tx| !tx.is_closed());
        waiters.len()
    }
}

/// Offers admissions for one pod kind while it is below its ceiling.
pub struct CapacityManager {
    kind: PodKind,
    tracker: Arc<PodTracker>,
    signal: AdmissionSignal,
    ceiling: usize,
    interval: Duration,
}

impl CapacityManager {
    pub fn new(
        kind: PodKind,
        tracker: Arc<PodTracker>,
        signal: AdmissionSignal,
        ceiling: usize,
        interval: Duration,
    ) -> Self {
        Self {
            kind,
            tracker,
            signal,
            ceiling,
            interval,
        }
    }

    /// Check capacity once. Returns true if an admission was delivered.
    pub fn tick(&self) -> bool {
        let running = self.tracker.count(self.kind);
        if running >= self.ceiling {
            trace!(kind = %self.kind, running, ceiling = self.ceiling, "At capacity");
            return false;
        }
        let admitted = self.signal.offer();
        if admitted {
            debug!(kind = %self.kind, running, ceiling = self.ceiling, "Admitted one");
        }
        admitted
    }

    /// Tick until cancelled.
    #[instrument(skip_all, fields(kind = %self.kind))]
    pub async fn run(self, cancel: CancellationToken) {
        debug!(
            ceiling = self.ceiling,
            interval_ms = self.interval.as_millis() as u64,
            "Starting capacity manager"
        );

        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick();
                }
                _ = cancel.cancelled() => {
                    debug!("Capacity manager shutting down");
                    break;
                }
            }
        }
    }
}
