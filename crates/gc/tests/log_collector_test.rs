use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use common::traits::{BlobStore, DeleteOutcome};
use common::{
    BlobId, BlobListing, NamespaceId, NamespacePolicy, ObjectKey, ObjectRecord,
    StaticPolicyResolver,
};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use gc::{GcConfig, GcError, LogOrphanCollector};
use storage::{InMemoryBlobStore, InMemoryReferenceStore};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;
use txlog::codec::HEADER_LEN;
use txlog::{LogOptions, LogRegistry, TransactionEvent, TransactionLog};

const OLD: Duration = Duration::from_secs(2 * 60 * 60);

struct Harness {
    dir: TempDir,
    registry: Arc<LogRegistry>,
    blobs: InMemoryBlobStore,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let options = LogOptions::builder(dir.path()).sync_appends(false).build();
        let registry = Arc::new(LogRegistry::open(options).unwrap());
        Self {
            dir,
            registry,
            blobs: InMemoryBlobStore::new(),
        }
    }

    fn log(&self, ns: &str) -> Arc<TransactionLog> {
        self.registry.get_or_create(&NamespaceId::new(ns)).unwrap()
    }

    fn collector_with(
        &self,
        blobs: Arc<dyn BlobStore>,
        policies: StaticPolicyResolver,
    ) -> LogOrphanCollector {
        let config = GcConfig::builder()
            .grace_period(Duration::from_secs(60))
            .scan_page_size(4)
            .build();
        LogOrphanCollector::new(self.registry.clone(), blobs, Arc::new(policies), config)
    }

    fn collector(&self, policies: StaticPolicyResolver) -> LogOrphanCollector {
        self.collector_with(Arc::new(self.blobs.clone()), policies)
    }
}

fn add(name: &str, data: &[u8]) -> TransactionEvent {
    TransactionEvent::add(ObjectKey::new("bucket", name), vec![BlobId::of(data)])
}

fn remove(name: &str) -> TransactionEvent {
    TransactionEvent::remove(ObjectKey::new("bucket", name))
}

fn legacy(names: &[&str]) -> StaticPolicyResolver {
    names.iter().fold(StaticPolicyResolver::new(), |resolver, name| {
        resolver.with(*name, NamespacePolicy::legacy())
    })
}

#[tokio::test]
async fn collects_only_unreachable_blobs_past_grace() {
    let h = Harness::new();
    let (a, b) = (NamespaceId::new("a"), NamespaceId::new("b"));

    let log_a = h.log("a");
    log_a.append(&add("k1", b"rooted")).unwrap();
    log_a.append(&add("k2", b"removed")).unwrap();
    log_a.append(&remove("k2")).unwrap();
    h.log("b").append(&add("k3", b"b-only")).unwrap();

    let rooted = h.blobs.put_aged(&a, b"rooted", OLD).unwrap();
    let orphan = h.blobs.put_aged(&a, b"orphan", OLD).unwrap();
    let young = h.blobs.put_aged(&a, b"young", Duration::ZERO).unwrap();
    let removed = h.blobs.put_aged(&a, b"removed", OLD).unwrap();
    h.blobs.put_aged(&b, b"orphan", OLD).unwrap();
    let b_only = h.blobs.put_aged(&b, b"b-only", OLD).unwrap();

    let report = h
        .collector(legacy(&["a", "b"]))
        .collect(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.namespaces, 2);
    assert_eq!(report.candidates, 4);
    assert_eq!(report.reclaimed, 2);
    assert_eq!(report.kept, 2);
    assert_eq!(report.failed, 0);

    assert!(h.blobs.contains(&a, &rooted).unwrap());
    assert!(h.blobs.contains(&a, &young).unwrap());
    assert!(h.blobs.contains(&b, &b_only).unwrap());
    assert!(!h.blobs.contains(&a, &orphan).unwrap());
    assert!(!h.blobs.contains(&b, &orphan).unwrap());
    assert!(!h.blobs.contains(&a, &removed).unwrap());
}

/// Appends an add for `late` the first time blobs are listed, i.e. after
/// the collector has taken its root snapshot.
struct LateWriter {
    inner: InMemoryBlobStore,
    log: Arc<TransactionLog>,
    late: TransactionEvent,
    fired: AtomicBool,
}

impl BlobStore for LateWriter {
    fn exists<'a>(&'a self, ns: &'a NamespaceId, blob: &'a BlobId) -> BoxFuture<'a, Result<bool>> {
        self.inner.exists(ns, blob)
    }

    fn delete_object<'a>(
        &'a self,
        ns: &'a NamespaceId,
        blob: &'a BlobId,
    ) -> BoxFuture<'a, Result<DeleteOutcome>> {
        self.inner.delete_object(ns, blob)
    }

    fn list_objects<'a>(&'a self, ns: &'a NamespaceId) -> BoxStream<'a, Result<BlobListing>> {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.log.append(&self.late).expect("late append");
        }
        self.inner.list_objects(ns)
    }
}

#[tokio::test]
async fn late_add_in_log_tail_keeps_blob() {
    let h = Harness::new();
    let a = NamespaceId::new("a");
    let log = h.log("a");
    log.append(&add("early", b"early")).unwrap();
    let late_blob = h.blobs.put_aged(&a, b"late", OLD).unwrap();

    let store = Arc::new(LateWriter {
        inner: h.blobs.clone(),
        log,
        late: add("late", b"late"),
        fired: AtomicBool::new(false),
    });
    let collector = h.collector_with(store, legacy(&["a"]));

    let report = collector.collect(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.candidates, 1);
    assert_eq!(report.kept, 1);
    assert_eq!(report.reclaimed, 0);
    assert!(h.blobs.contains(&a, &late_blob).unwrap());
}

#[tokio::test]
async fn corrupt_log_aborts_pass_without_deleting() {
    let h = Harness::new();
    let (a, b) = (NamespaceId::new("a"), NamespaceId::new("b"));
    h.log("a").append(&add("k", b"kept")).unwrap();
    h.log("b").append(&add("k", b"unknown")).unwrap();
    h.blobs.put_aged(&a, b"orphan", OLD).unwrap();

    let path = h.dir.path().join("b").join("transactions.log");
    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(HEADER_LEN as u64 + 1)).unwrap();
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte).unwrap();
    file.seek(SeekFrom::Current(-1)).unwrap();
    file.write_all(&[byte[0] ^ 0x80]).unwrap();

    let err = h
        .collector(legacy(&["a", "b"]))
        .collect(&CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        GcError::RootScan { namespace, .. } => assert_eq!(namespace, b),
        other => panic!("expected root scan failure, got {other:?}"),
    }
    assert!(h.blobs.deletions().unwrap().is_empty());
}

#[tokio::test]
async fn failed_delete_is_not_counted_but_all_namespaces_are_tried() {
    let h = Harness::new();
    let (a, b) = (NamespaceId::new("a"), NamespaceId::new("b"));
    h.log("a");
    h.log("b");
    let stuck = h.blobs.put_aged(&a, b"stuck", OLD).unwrap();
    h.blobs.put_aged(&b, b"stuck", OLD).unwrap();
    h.blobs.fail_deletes_of(stuck).unwrap();

    let report = h
        .collector(legacy(&["a", "b"]))
        .collect(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.reclaimed, 0);
    assert_eq!(report.failed, 1);
    let attempted: Vec<NamespaceId> = h
        .blobs
        .deletions()
        .unwrap()
        .into_iter()
        .map(|(ns, _)| ns)
        .collect();
    assert_eq!(attempted, vec![a, b]);
}

#[tokio::test]
#[traced_test]
async fn namespaces_without_policy_are_left_alone() {
    let h = Harness::new();
    let c = NamespaceId::new("c");
    h.log("a");
    h.log("c");
    let orphan = h.blobs.put_aged(&c, b"orphan", OLD).unwrap();

    let report = h
        .collector(legacy(&["a"]))
        .collect(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.namespaces, 1);
    assert_eq!(report.reclaimed, 0);
    assert!(h.blobs.contains(&c, &orphan).unwrap());
    assert!(logs_contain("no cleanup policy configured"));
}

#[tokio::test]
async fn cancelled_pass_deletes_nothing() {
    let h = Harness::new();
    let a = NamespaceId::new("a");
    h.log("a").append(&add("k", b"kept")).unwrap();
    h.blobs.put_aged(&a, b"orphan", OLD).unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = h.collector(legacy(&["a"])).collect(&cancel).await.unwrap_err();
    assert!(matches!(err, GcError::Cancelled));
    assert!(h.blobs.deletions().unwrap().is_empty());
}

/// `legacy` and `indexed` share the "p" pool; only `legacy` is log-replayed.
fn mixed_pool(h: &Harness) -> (NamespaceId, NamespaceId, StaticPolicyResolver) {
    let (legacy, indexed) = (NamespaceId::new("legacy"), NamespaceId::new("indexed"));
    h.blobs.assign_pool(&legacy, "p").unwrap();
    h.blobs.assign_pool(&indexed, "p").unwrap();
    let policies = StaticPolicyResolver::new()
        .with(
            legacy.clone(),
            NamespacePolicy {
                storage_pool: Some("p".to_string()),
                ..NamespacePolicy::legacy()
            },
        )
        .with(indexed.clone(), NamespacePolicy::current_in_pool("p"));
    (legacy, indexed, policies)
}

#[tokio::test]
async fn shared_pool_without_index_keeps_blobs() {
    let h = Harness::new();
    let (legacy, indexed, policies) = mixed_pool(&h);
    h.log("legacy");
    h.log("indexed").append(&add("k", b"indexed-object")).unwrap();
    let blob = h.blobs.put_aged(&indexed, b"indexed-object", OLD).unwrap();

    let report = h
        .collector(policies)
        .collect(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.namespaces, 1);
    assert_eq!(report.pools, 1);
    assert_eq!(report.candidates, 1);
    assert_eq!(report.kept, 1);
    assert_eq!(report.reclaimed, 0);
    assert!(h.blobs.contains(&legacy, &blob).unwrap());
    assert!(h.blobs.deletions().unwrap().is_empty());
}

#[tokio::test]
async fn shared_pool_consults_reference_index() {
    let h = Harness::new();
    let (legacy, indexed, policies) = mixed_pool(&h);
    h.log("legacy");
    let referenced = h.blobs.put_aged(&indexed, b"referenced", OLD).unwrap();
    let orphan = h.blobs.put_aged(&legacy, b"orphan", OLD).unwrap();

    let references = InMemoryReferenceStore::new();
    references
        .put_record(ObjectRecord {
            namespace: indexed.clone(),
            key: ObjectKey::new("bucket", "k"),
            blobs: vec![referenced],
            last_access: SystemTime::now(),
        })
        .unwrap();

    let report = h
        .collector(policies)
        .with_reference_index(Arc::new(references))
        .collect(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.candidates, 2);
    assert_eq!(report.kept, 1);
    assert_eq!(report.reclaimed, 1);
    assert!(h.blobs.contains(&indexed, &referenced).unwrap());
    assert!(!h.blobs.contains(&indexed, &orphan).unwrap());
    assert_eq!(h.blobs.deletions().unwrap(), vec![(legacy, orphan)]);
}

#[tokio::test]
async fn configured_namespace_without_log_is_collected() {
    let h = Harness::new();
    let quiet = NamespaceId::new("quiet");
    let orphan = h.blobs.put_aged(&quiet, b"never-published", OLD).unwrap();

    let report = h
        .collector(legacy(&["quiet"]))
        .collect(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.namespaces, 1);
    assert_eq!(report.reclaimed, 1);
    assert!(!h.blobs.contains(&quiet, &orphan).unwrap());
    assert!(h.registry.get(&quiet).unwrap().is_none());
}
