use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use common::{BlobId, NamespaceId, NamespacePolicy, ObjectKey, ObjectRecord, StaticPolicyResolver};
use futures::future::BoxFuture;
use gc::{
    CleanupScheduler, CleanupService, CollectionReport, GcConfig, GcResult, NamespaceCleanup,
    PeriodicTask, ReferenceCleaner, ReferenceCleanupDriver, ServiceDriver, TickOutcome,
};
use storage::{InMemoryReferenceStore, LeaderFlag};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

/// Counts runs; each run blocks until released.
struct GatedService {
    runs: AtomicUsize,
    release: Notify,
}

impl GatedService {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            runs: AtomicUsize::new(0),
            release: Notify::new(),
        })
    }
}

impl CleanupService for GatedService {
    fn name(&self) -> &'static str {
        "gated"
    }

    fn run_once<'a>(
        &'a self,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, GcResult<CollectionReport>> {
        Box::pin(async move {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok(CollectionReport::default())
        })
    }
}

/// Completes immediately, counting runs.
struct InstantService {
    runs: AtomicUsize,
}

impl CleanupService for InstantService {
    fn name(&self) -> &'static str {
        "instant"
    }

    fn run_once<'a>(
        &'a self,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, GcResult<CollectionReport>> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(CollectionReport::default()) })
    }
}

#[tokio::test]
async fn follower_does_not_run() {
    let service = GatedService::new();
    let driver = ServiceDriver::new(service.clone(), Arc::new(LeaderFlag::new(false)));
    let outcome = driver.tick(&CancellationToken::new()).await;
    assert_eq!(outcome, TickOutcome::NotLeader);
    driver.wait_idle().await;
    assert_eq!(service.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn overlapping_ticks_are_skipped() {
    let service = GatedService::new();
    let driver = ServiceDriver::new(service.clone(), Arc::new(LeaderFlag::new(true)));
    let cancel = CancellationToken::new();

    assert_eq!(driver.tick(&cancel).await, TickOutcome::Started);
    assert_eq!(driver.tick(&cancel).await, TickOutcome::AlreadyRunning);

    service.release.notify_one();
    driver.wait_idle().await;
    assert_eq!(service.runs.load(Ordering::SeqCst), 1);

    assert_eq!(driver.tick(&cancel).await, TickOutcome::Started);
    service.release.notify_one();
    driver.wait_idle().await;
    assert_eq!(service.runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn leadership_change_takes_effect_next_tick() {
    let flag = LeaderFlag::new(false);
    let service = Arc::new(InstantService {
        runs: AtomicUsize::new(0),
    });
    let driver = ServiceDriver::new(service.clone(), Arc::new(flag.clone()));
    let cancel = CancellationToken::new();

    assert_eq!(driver.tick(&cancel).await, TickOutcome::NotLeader);
    flag.set(true);
    assert_eq!(driver.tick(&cancel).await, TickOutcome::Started);
    driver.wait_idle().await;
    flag.set(false);
    assert_eq!(driver.tick(&cancel).await, TickOutcome::NotLeader);
    assert_eq!(service.runs.load(Ordering::SeqCst), 1);
}

/// Namespace cleanup that waits on a shared gate.
struct GatedCleanup {
    gate: Arc<Semaphore>,
    calls: AtomicUsize,
}

impl NamespaceCleanup for GatedCleanup {
    fn strategy(&self) -> common::CleanupStrategy {
        common::CleanupStrategy::Current
    }

    fn cleanup<'a>(
        &'a self,
        _namespace: &'a NamespaceId,
        _cutoff: SystemTime,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, GcResult<usize>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let permit = self.gate.acquire().await;
            drop(permit);
            Ok(0)
        })
    }
}

#[tokio::test]
async fn reference_cleanup_reuses_unfinished_tasks() {
    let references = InMemoryReferenceStore::new();
    let mut policies = StaticPolicyResolver::new();
    for name in ["one", "two"] {
        let ns = NamespaceId::new(name);
        references
            .put_record(ObjectRecord {
                namespace: ns.clone(),
                key: ObjectKey::new("bucket", "k"),
                blobs: vec![BlobId::of(name.as_bytes())],
                last_access: SystemTime::now(),
            })
            .unwrap();
        policies.insert(ns, NamespacePolicy::default());
    }

    let gate = Arc::new(Semaphore::new(0));
    let cleanup = Arc::new(GatedCleanup {
        gate: gate.clone(),
        calls: AtomicUsize::new(0),
    });
    let cleaner = Arc::new(ReferenceCleaner::new(
        cleanup.clone(),
        cleanup.clone(),
        Arc::new(policies),
        &GcConfig::default(),
    ));
    let driver = ReferenceCleanupDriver::new(
        cleaner,
        Arc::new(references),
        Arc::new(LeaderFlag::new(true)),
    );
    let cancel = CancellationToken::new();

    assert_eq!(
        driver.tick(&cancel).await,
        TickOutcome::FannedOut {
            started: 2,
            reused: 0
        }
    );
    assert_eq!(
        driver.tick(&cancel).await,
        TickOutcome::FannedOut {
            started: 0,
            reused: 2
        }
    );

    gate.add_permits(2);
    driver.wait_idle().await;
    assert_eq!(cleanup.calls.load(Ordering::SeqCst), 2);

    gate.add_permits(2);
    assert_eq!(
        driver.tick(&cancel).await,
        TickOutcome::FannedOut {
            started: 2,
            reused: 0
        }
    );
    driver.wait_idle().await;
    assert_eq!(cleanup.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn scheduler_runs_until_shutdown() {
    let service = Arc::new(InstantService {
        runs: AtomicUsize::new(0),
    });
    let handle = CleanupScheduler::new(
        Arc::new(LeaderFlag::new(true)),
        Duration::from_millis(10),
    )
    .with_service(service.clone())
    .start(CancellationToken::new());

    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.shutdown().await;

    let runs = service.runs.load(Ordering::SeqCst);
    assert!(runs >= 2, "expected several runs, got {runs}");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(service.runs.load(Ordering::SeqCst), runs);
}
