//! Pod state synchronization.
//!
//! The [`PodTracker`] holds the set of Worker and Job pods that currently
//! consume capacity. A [`PodSynchronizer`] per pod kind keeps it current by
//! listing and then watching the substrate, and schedules deletion of pods
//! that have finished.
//!
//! # Invariants
//!
//! - A pod is counted iff it has no deletion timestamp and is Pending,
//!   Running or Unknown
//! - At most one delayed deletion is in flight per pod
//! - No lock is held across I/O

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use brig_id::NamespacedPodName;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::substrate::{Pod, PodKind, PodSource, SubstrateError, WatchEvent};

#[derive(Default)]
struct CapacitySets {
    workers: HashSet<NamespacedPodName>,
    jobs: HashSet<NamespacedPodName>,
}

impl CapacitySets {
    fn of(&mut self, kind: PodKind) -> &mut HashSet<NamespacedPodName> {
        match kind {
            PodKind::Worker => &mut self.workers,
            PodKind::Job => &mut self.jobs,
        }
    }
}

/// Live view of capacity-consuming pods.
#[derive(Default)]
pub struct PodTracker {
    capacity: Mutex<CapacitySets>,
    deleting: Mutex<HashMap<NamespacedPodName, PodKind>>,
}

impl PodTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pods of `kind` currently consuming capacity.
    pub fn count(&self, kind: PodKind) -> usize {
        self.capacity.lock().of(kind).len()
    }

    /// Whether `pod` is currently counted.
    pub fn contains(&self, kind: PodKind, pod: &NamespacedPodName) -> bool {
        self.capacity.lock().of(kind).contains(pod)
    }

    /// Whether a delayed deletion is pending for `pod`.
    pub fn is_deleting(&self, pod: &NamespacedPodName) -> bool {
        self.deleting.lock().contains_key(pod)
    }

    /// Recompute membership of one pod from its latest state.
    pub fn observe(&self, kind: PodKind, pod: &Pod) {
        let key = pod.key();
        let mut capacity = self.capacity.lock();
        if pod.consumes_capacity() {
            capacity.of(kind).insert(key);
        } else {
            capacity.of(kind).remove(&key);
        }
    }

    /// Forget a pod the substrate reports as gone.
    pub fn forget(&self, kind: PodKind, pod: &NamespacedPodName) {
        self.capacity.lock().of(kind).remove(pod);
        self.deleting.lock().remove(pod);
    }

    /// Replace everything known about `kind` with a fresh listing.
    ///
    /// Deletion guards for pods missing from the listing are released.
    pub fn replace(&self, kind: PodKind, pods: &[Pod]) {
        let counted: HashSet<NamespacedPodName> = pods
            .iter()
            .filter(|p| p.consumes_capacity())
            .map(Pod::key)
            .collect();
        *self.capacity.lock().of(kind) = counted;

        let present: HashSet<NamespacedPodName> = pods.iter().map(Pod::key).collect();
        self.deleting
            .lock()
            .retain(|pod, k| *k != kind || present.contains(pod));
    }

    /// Claim the deletion guard for `pod`. Returns false if already claimed.
    fn claim_deletion(&self, kind: PodKind, pod: &NamespacedPodName) -> bool {
        let mut deleting = self.deleting.lock();
        if deleting.contains_key(pod) {
            return false;
        }
        deleting.insert(pod.clone(), kind);
        true
    }
}

/// Keeps the tracker in step with the substrate for one pod kind.
pub struct PodSynchronizer {
    kind: PodKind,
    source: Arc<dyn PodSource>,
    tracker: Arc<PodTracker>,
    tasks: TaskTracker,
    deletion_delay: Duration,
    restart_backoff: Duration,
    resource_version: Option<String>,
}

impl PodSynchronizer {
    pub fn new(
        kind: PodKind,
        source: Arc<dyn PodSource>,
        tracker: Arc<PodTracker>,
        tasks: TaskTracker,
        deletion_delay: Duration,
        restart_backoff: Duration,
    ) -> Self {
        Self {
            kind,
            source,
            tracker,
            tasks,
            deletion_delay,
            restart_backoff,
            resource_version: None,
        }
    }

    /// List existing pods and populate the tracker before returning.
    pub async fn sync_existing(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<(), SubstrateError> {
        let rv = self.relist(cancel).await?;
        self.resource_version = Some(rv);
        info!(
            kind = %self.kind,
            count = self.tracker.count(self.kind),
            "Synced existing pods"
        );
        Ok(())
    }

    async fn relist(&self, cancel: &CancellationToken) -> Result<String, SubstrateError> {
        let list = self.source.list(&self.kind.label_selector()).await?;
        self.tracker.replace(self.kind, &list.items);
        for pod in &list.items {
            self.maybe_schedule_deletion(pod, cancel);
        }
        Ok(list.metadata.resource_version.unwrap_or_default())
    }

    /// Watch for changes until cancelled, relisting whenever the watch ends.
    #[instrument(skip_all, fields(kind = %self.kind))]
    pub async fn run(mut self, cancel: CancellationToken) {
        let selector = self.kind.label_selector();
        debug!("Starting pod synchronizer");

        loop {
            let rv = match self.resource_version.take() {
                Some(rv) => rv,
                None => {
                    let relisted = tokio::select! {
                        _ = cancel.cancelled() => break,
                        res = self.relist(&cancel) => res,
                    };
                    match relisted {
                        Ok(rv) => rv,
                        Err(e) => {
                            warn!(error = %e, "Pod relist failed");
                            if self.backoff(&cancel).await {
                                break;
                            }
                            continue;
                        }
                    }
                }
            };

            let watched = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.source.watch(&selector, &rv) => res,
            };
            let mut stream = match watched {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "Pod watch failed to start");
                    if self.backoff(&cancel).await {
                        break;
                    }
                    continue;
                }
            };

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => None,
                    next = stream.next() => Some(next),
                };
                match next {
                    None => {
                        debug!("Pod synchronizer shutting down");
                        return;
                    }
                    Some(Some(Ok(event))) => self.handle(event, &cancel),
                    Some(Some(Err(e))) => {
                        if e.is_gone() {
                            debug!(error = %e, "Watch resource version expired");
                        } else {
                            warn!(error = %e, "Pod watch failed");
                        }
                        break;
                    }
                    Some(None) => {
                        debug!("Pod watch ended");
                        break;
                    }
                }
            }

            if self.backoff(&cancel).await {
                break;
            }
        }

        debug!("Pod synchronizer shutting down");
    }

    /// Sleep for the restart backoff. Returns true if cancelled meanwhile.
    async fn backoff(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(self.restart_backoff) => false,
        }
    }

    fn handle(&self, event: WatchEvent, cancel: &CancellationToken) {
        match event {
            WatchEvent::Added(pod) | WatchEvent::Modified(pod) => {
                self.tracker.observe(self.kind, &pod);
                self.maybe_schedule_deletion(&pod, cancel);
            }
            WatchEvent::Deleted(pod) => {
                let key = pod.key();
                debug!(pod = %key, "Pod deleted");
                self.tracker.forget(self.kind, &key);
            }
            WatchEvent::Bookmark(rv) => {
                debug!(resource_version = %rv, "Watch bookmark");
            }
        }
    }

    fn maybe_schedule_deletion(&self, pod: &Pod, cancel: &CancellationToken) {
        if pod.is_being_deleted() || !pod.phase().is_terminal() {
            return;
        }
        let key = pod.key();
        if !self.tracker.claim_deletion(self.kind, &key) {
            return;
        }

        let finished_at = pod
            .primary_container_terminated()
            .and_then(|t| t.finished_at);
        debug!(
            pod = %key,
            phase = ?pod.phase(),
            finished_at = ?finished_at,
            delay_secs = self.deletion_delay.as_secs(),
            "Scheduling deletion of finished pod"
        );

        let source = Arc::clone(&self.source);
        let delay = self.deletion_delay;
        let kind = self.kind;
        let cancel = cancel.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            match source.delete(&key).await {
                Ok(()) => info!(kind = %kind, pod = %key, "Deleted finished pod"),
                Err(e) => warn!(
                    kind = %kind,
                    pod = %key,
                    error = %e,
                    "Failed to delete finished pod"
                ),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::pod::fixtures::{deleting, pod};
    use crate::substrate::PodPhase;

    fn key(name: &str) -> NamespacedPodName {
        NamespacedPodName::new("ns", name)
    }

    #[test]
    fn test_observe_transitions() {
        let tracker = PodTracker::new();

        tracker.observe(PodKind::Worker, &pod("ns", "w1", PodPhase::Pending));
        assert_eq!(tracker.count(PodKind::Worker), 1);

        tracker.observe(PodKind::Worker, &pod("ns", "w1", PodPhase::Running));
        assert_eq!(tracker.count(PodKind::Worker), 1);

        tracker.observe(PodKind::Worker, &pod("ns", "w1", PodPhase::Succeeded));
        assert_eq!(tracker.count(PodKind::Worker), 0);
        assert_eq!(tracker.count(PodKind::Job), 0);
    }

    #[test]
    fn test_deletion_timestamp_removes() {
        let tracker = PodTracker::new();
        tracker.observe(PodKind::Job, &pod("ns", "j1", PodPhase::Running));
        tracker.observe(PodKind::Job, &deleting("ns", "j1", PodPhase::Running));
        assert!(!tracker.contains(PodKind::Job, &key("j1")));
    }

    #[test]
    fn test_kinds_are_independent() {
        let tracker = PodTracker::new();
        tracker.observe(PodKind::Worker, &pod("ns", "a", PodPhase::Running));
        tracker.observe(PodKind::Job, &pod("ns", "b", PodPhase::Running));
        tracker.observe(PodKind::Job, &pod("ns", "c", PodPhase::Unknown));
        assert_eq!(tracker.count(PodKind::Worker), 1);
        assert_eq!(tracker.count(PodKind::Job), 2);
    }

    #[test]
    fn test_replace_drops_vanished_pods() {
        let tracker = PodTracker::new();
        tracker.observe(PodKind::Job, &pod("ns", "gone", PodPhase::Running));
        assert!(tracker.claim_deletion(PodKind::Job, &key("gone-too")));
        assert!(tracker.claim_deletion(PodKind::Worker, &key("other-kind")));

        tracker.replace(PodKind::Job, &[pod("ns", "fresh", PodPhase::Pending)]);

        assert!(!tracker.contains(PodKind::Job, &key("gone")));
        assert!(tracker.contains(PodKind::Job, &key("fresh")));
        assert!(!tracker.is_deleting(&key("gone-too")));
        assert!(tracker.is_deleting(&key("other-kind")));
    }

    #[test]
    fn test_claim_deletion_once() {
        let tracker = PodTracker::new();
        assert!(tracker.claim_deletion(PodKind::Job, &key("j1")));
        assert!(!tracker.claim_deletion(PodKind::Job, &key("j1")));

        tracker.forget(PodKind::Job, &key("j1"));
        assert!(tracker.claim_deletion(PodKind::Job, &key("j1")));
    }
}
