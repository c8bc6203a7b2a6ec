//! Integration tests for pod state synchronization.

mod common;

use std::sync::Arc;
use std::time::Duration;

use brig_scheduler::substrate::{PodKind, PodPhase};
use brig_scheduler::sync::{PodSynchronizer, PodTracker};
use common::{consistently, eventually, key, pod, FakePods};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

struct Harness {
    pods: Arc<FakePods>,
    tracker: Arc<PodTracker>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl Harness {
    fn new() -> Self {
        Self {
            pods: FakePods::new(),
            tracker: Arc::new(PodTracker::new()),
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    fn synchronizer(&self, kind: PodKind, deletion_delay: Duration) -> PodSynchronizer {
        PodSynchronizer::new(
            kind,
            self.pods.clone(),
            Arc::clone(&self.tracker),
            self.tasks.clone(),
            deletion_delay,
            Duration::from_millis(10),
        )
    }

    async fn start(&self, kind: PodKind, deletion_delay: Duration) {
        let mut synchronizer = self.synchronizer(kind, deletion_delay);
        synchronizer.sync_existing(&self.cancel).await.unwrap();
        self.tasks.spawn(synchronizer.run(self.cancel.clone()));
        eventually("watch to open", || self.pods.watch_count(kind) == 1).await;
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        self.tasks.close();
        tokio::time::timeout(Duration::from_secs(5), self.tasks.wait())
            .await
            .expect("synchronizer tasks did not exit");
    }
}

#[tokio::test]
async fn test_sync_existing_counts_live_pods() {
    let h = Harness::new();
    h.pods.put(PodKind::Worker, pod("ns", "w1", PodPhase::Running));
    h.pods.put(PodKind::Worker, pod("ns", "w2", PodPhase::Pending));
    h.pods.put(PodKind::Worker, pod("ns", "w3", PodPhase::Unknown));
    h.pods.put(PodKind::Worker, pod("ns", "w4", PodPhase::Succeeded));
    h.pods.put(PodKind::Job, pod("ns", "j1", PodPhase::Running));

    let mut synchronizer = h.synchronizer(PodKind::Worker, Duration::from_secs(60));
    synchronizer.sync_existing(&h.cancel).await.unwrap();

    assert_eq!(h.tracker.count(PodKind::Worker), 3);
    assert_eq!(h.tracker.count(PodKind::Job), 0);
    h.shutdown().await;
}

#[tokio::test]
async fn test_sync_existing_failure_is_reported() {
    let h = Harness::new();
    h.pods.fail_listing(true);

    let mut synchronizer = h.synchronizer(PodKind::Job, Duration::from_secs(60));
    assert!(synchronizer.sync_existing(&h.cancel).await.is_err());
    h.shutdown().await;
}

#[tokio::test]
async fn test_watch_tracks_transitions() {
    let h = Harness::new();
    h.start(PodKind::Job, Duration::from_secs(60)).await;

    h.pods.put(PodKind::Job, pod("ns", "j1", PodPhase::Pending));
    eventually("pending pod counted", || h.tracker.count(PodKind::Job) == 1).await;

    h.pods.put(PodKind::Job, pod("ns", "j1", PodPhase::Running));
    h.pods.put(PodKind::Job, pod("ns", "j2", PodPhase::Running));
    eventually("both pods counted", || h.tracker.count(PodKind::Job) == 2).await;

    h.pods.put(PodKind::Job, pod("ns", "j1", PodPhase::Failed));
    eventually("failed pod released", || h.tracker.count(PodKind::Job) == 1).await;

    h.pods.remove(PodKind::Job, &key("ns", "j2"));
    eventually("deleted pod released", || h.tracker.count(PodKind::Job) == 0).await;

    h.shutdown().await;
}

#[tokio::test]
async fn test_finished_pod_deleted_once_after_delay() {
    let h = Harness::new();
    h.start(PodKind::Worker, Duration::from_millis(50)).await;

    h.pods.put(PodKind::Worker, pod("ns", "w1", PodPhase::Running));
    eventually("pod counted", || h.tracker.count(PodKind::Worker) == 1).await;

    h.pods.put(PodKind::Worker, pod("ns", "w1", PodPhase::Succeeded));
    // A second status update for the same finished pod.
    h.pods.put(PodKind::Worker, pod("ns", "w1", PodPhase::Succeeded));
    eventually("deletion scheduled", || h.tracker.is_deleting(&key("ns", "w1"))).await;
    assert!(h.pods.deleted().is_empty());

    eventually("pod deleted", || !h.pods.deleted().is_empty()).await;
    eventually("deletion guard released", || !h.tracker.is_deleting(&key("ns", "w1"))).await;
    consistently("pod deleted exactly once", || h.pods.deleted().len() == 1).await;

    h.shutdown().await;
}

#[tokio::test]
async fn test_finished_pods_found_at_startup_are_deleted() {
    let h = Harness::new();
    h.pods.put(PodKind::Job, pod("ns", "old", PodPhase::Failed));

    h.start(PodKind::Job, Duration::from_millis(10)).await;
    assert_eq!(h.tracker.count(PodKind::Job), 0);

    eventually("leftover pod deleted", || h.pods.deleted() == vec![key("ns", "old")]).await;
    h.shutdown().await;
}

#[tokio::test]
async fn test_cancellation_aborts_pending_deletions() {
    let h = Harness::new();
    h.pods.put(PodKind::Job, pod("ns", "j1", PodPhase::Succeeded));
    h.start(PodKind::Job, Duration::from_secs(60)).await;
    assert!(h.tracker.is_deleting(&key("ns", "j1")));

    let pods = h.pods.clone();
    h.shutdown().await;
    assert!(pods.deleted().is_empty());
}

#[tokio::test]
async fn test_relist_after_watch_ends() {
    let h = Harness::new();
    h.pods.put(PodKind::Worker, pod("ns", "w1", PodPhase::Running));
    h.start(PodKind::Worker, Duration::from_secs(60)).await;
    assert_eq!(h.tracker.count(PodKind::Worker), 1);

    // Changes missed while no watch is open.
    h.pods.end_watches();
    h.pods.remove_silently(PodKind::Worker, &key("ns", "w1"));
    h.pods.put(PodKind::Worker, pod("ns", "w2", PodPhase::Pending));
    h.pods.put(PodKind::Worker, pod("ns", "w3", PodPhase::Pending));

    eventually("relisted view", || {
        h.tracker.count(PodKind::Worker) == 2
            && !h.tracker.contains(PodKind::Worker, &key("ns", "w1"))
    })
    .await;
    eventually("watch reopened", || h.pods.watch_count(PodKind::Worker) == 1).await;

    h.shutdown().await;
}

#[tokio::test]
async fn test_relist_after_expired_watch() {
    let h = Harness::new();
    h.start(PodKind::Job, Duration::from_secs(60)).await;
    let lists_before = h.pods.list_calls();

    h.pods.expire_watches();
    eventually("relisted", || h.pods.list_calls() > lists_before).await;
    eventually("watch reopened", || h.pods.watch_count(PodKind::Job) == 1).await;

    h.pods.put(PodKind::Job, pod("ns", "j1", PodPhase::Running));
    eventually("new watch delivers events", || h.tracker.count(PodKind::Job) == 1).await;

    h.shutdown().await;
}
