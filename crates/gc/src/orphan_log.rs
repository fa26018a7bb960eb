use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::SystemTime;

use common::traits::{BlobStore, NamespacePolicyResolver, ReferenceStore};
use common::{BlobId, CleanupStrategy, NamespaceId};
use futures::future::join_all;
use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use txlog::LogRegistry;

use crate::config::GcConfig;
use crate::error::{GcError, GcResult};
use crate::orphan_index::IndexOrphanCollector;
use crate::remote::{collect_remote_roots, RemoteLogSource, RemoteRoots};
use crate::roots::{GcRootState, RootScanner};
use crate::sweep::{delete_everywhere, past_grace, select_namespaces, BlobVerdict, CollectionReport};

/// Root sets taken at the start of a pass.
struct PassSnapshot {
    namespaces: Vec<NamespaceId>,
    roots: HashMap<NamespaceId, GcRootState>,
    remote: RemoteRoots,
    /// Index-tracked namespaces sharing a storage pool with a collected
    /// namespace.
    pool_guests: Vec<NamespaceId>,
}

/// Collects blobs unreachable from the transaction logs of every
/// log-replayed (legacy) namespace.
///
/// Deleting a blob removes it from every storage pool the collected
/// namespaces use, so index-tracked namespaces in those pools are consulted
/// through the reference index before anything is deleted. Without an index
/// such blobs are kept.
#[derive(Clone)]
pub struct LogOrphanCollector {
    registry: Arc<LogRegistry>,
    scanner: Arc<RootScanner>,
    blobs: Arc<dyn BlobStore>,
    policies: Arc<dyn NamespacePolicyResolver>,
    index: Option<IndexOrphanCollector>,
    remotes: Vec<Arc<dyn RemoteLogSource>>,
    config: GcConfig,
}

impl LogOrphanCollector {
    pub fn new(
        registry: Arc<LogRegistry>,
        blobs: Arc<dyn BlobStore>,
        policies: Arc<dyn NamespacePolicyResolver>,
        config: GcConfig,
    ) -> Self {
        let scanner = Arc::new(RootScanner::new(registry.clone(), config.scan_page_size));
        Self {
            registry,
            scanner,
            blobs,
            policies,
            index: None,
            remotes: Vec::new(),
            config,
        }
    }

    /// Resolve references held by index-tracked pool members through
    /// `references`.
    pub fn with_reference_index(mut self, references: Arc<dyn ReferenceStore>) -> Self {
        self.index = Some(IndexOrphanCollector::new(
            references,
            self.blobs.clone(),
            self.policies.clone(),
            self.config.clone(),
        ));
        self
    }

    /// Also keep blobs still referenced by the same namespaces at other
    /// sites.
    pub fn with_remote_sources(mut self, remotes: Vec<Arc<dyn RemoteLogSource>>) -> Self {
        self.remotes = remotes;
        self
    }

    pub fn scanner(&self) -> &Arc<RootScanner> {
        &self.scanner
    }

    /// Run one pass. Fails without deleting anything if any root set cannot
    /// be computed.
    #[instrument(skip_all)]
    pub async fn collect(&self, cancel: &CancellationToken) -> GcResult<CollectionReport> {
        let known = self.known_namespaces()?;
        let legacy = select_namespaces(self.policies.as_ref(), known.clone(), CleanupStrategy::Legacy);
        let pools: BTreeSet<String> = legacy
            .iter()
            .map(|(namespace, policy)| policy.pool_for(namespace))
            .collect();
        let namespaces: Vec<NamespaceId> = legacy.into_iter().map(|(namespace, _)| namespace).collect();
        let pool_guests = self.pool_guests(known, &pools);

        let mut report = CollectionReport {
            namespaces: namespaces.len(),
            pools: pools.len(),
            ..CollectionReport::default()
        };
        if namespaces.is_empty() {
            debug!("no log-replayed namespaces to collect");
            return Ok(report);
        }
        if !pool_guests.is_empty() {
            debug!(
                guests = pool_guests.len(),
                indexed = self.index.is_some(),
                "storage pools shared with index-tracked namespaces"
            );
        }

        let roots = self.compute_all_roots(&namespaces, cancel).await?;
        let candidates = self.list_candidates(&namespaces, cancel).await?;
        report.candidates = candidates.len();
        // Read after listing so adds that raced the listing are seen.
        let remote = collect_remote_roots(
            &self.remotes,
            &namespaces,
            self.config.scan_page_size,
            cancel,
        )
        .await?;

        let snapshot = Arc::new(PassSnapshot {
            namespaces,
            roots,
            remote,
            pool_guests,
        });
        let semaphore = Arc::new(Semaphore::new(self.config.blob_parallelism));
        let mut handles = Vec::with_capacity(candidates.len());

        for blob in candidates {
            if cancel.is_cancelled() {
                report.skipped += 1;
                continue;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| GcError::Cancelled)?;
            let collector = self.clone();
            let snapshot = snapshot.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                collector.evaluate(blob, &snapshot, &cancel).await
            }));
        }

        for joined in join_all(handles).await {
            match joined {
                Ok(verdict) => report.record(verdict),
                Err(err) => {
                    error!(error = %err, "blob evaluation task failed");
                    report.failed += 1;
                }
            }
        }

        if cancel.is_cancelled() {
            info!(?report, "log-based collection cancelled");
            return Err(GcError::Cancelled);
        }
        info!(
            namespaces = report.namespaces,
            candidates = report.candidates,
            kept = report.kept,
            reclaimed = report.reclaimed,
            failed = report.failed,
            "log-based collection pass complete"
        );
        Ok(report)
    }

    /// Namespaces with a log plus those with an explicit policy.
    fn known_namespaces(&self) -> GcResult<BTreeSet<NamespaceId>> {
        let mut known: BTreeSet<NamespaceId> = self
            .registry
            .list_namespaces()
            .map_err(|err| GcError::store("list_namespaces", err.into()))?
            .into_iter()
            .collect();
        known.extend(self.policies.configured_namespaces());
        Ok(known)
    }

    /// Namespaces not collected here whose storage pool is one of `pools`.
    fn pool_guests(&self, known: BTreeSet<NamespaceId>, pools: &BTreeSet<String>) -> Vec<NamespaceId> {
        known
            .into_iter()
            .filter(|namespace| match self.policies.policy(namespace) {
                Ok(policy) => {
                    policy.strategy != CleanupStrategy::Legacy
                        && pools.contains(&policy.pool_for(namespace))
                }
                Err(_) => false,
            })
            .collect()
    }

    async fn compute_all_roots(
        &self,
        namespaces: &[NamespaceId],
        cancel: &CancellationToken,
    ) -> GcResult<HashMap<NamespaceId, GcRootState>> {
        let semaphore = Arc::new(Semaphore::new(self.config.namespace_parallelism));
        let mut handles = Vec::with_capacity(namespaces.len());

        for namespace in namespaces {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| GcError::Cancelled)?;
            let scanner = self.scanner.clone();
            let namespace = namespace.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let state = scanner.compute_roots(&namespace, &cancel).await;
                (namespace, state)
            }));
        }

        let mut roots = HashMap::with_capacity(namespaces.len());
        for joined in join_all(handles).await {
            let (namespace, state) = joined?;
            match state {
                Ok(state) => {
                    roots.insert(namespace, state);
                }
                Err(err) => {
                    error!(namespace = %namespace, error = %err, "root scan failed; aborting collection pass");
                    return Err(err);
                }
            }
        }
        Ok(roots)
    }

    async fn list_candidates(
        &self,
        namespaces: &[NamespaceId],
        cancel: &CancellationToken,
    ) -> GcResult<BTreeSet<BlobId>> {
        let now = SystemTime::now();
        let mut candidates = BTreeSet::new();

        for namespace in namespaces {
            if cancel.is_cancelled() {
                return Err(GcError::Cancelled);
            }
            let mut listing = self.blobs.list_objects(namespace);
            while let Some(item) = listing.next().await {
                match item {
                    Ok(blob) if past_grace(blob.last_modified, now, self.config.grace_period) => {
                        candidates.insert(blob.blob);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(namespace = %namespace, error = %err, "blob listing failed; namespace contributes no candidates");
                        break;
                    }
                }
            }
        }
        Ok(candidates)
    }

    async fn evaluate(
        &self,
        blob: BlobId,
        snapshot: &PassSnapshot,
        cancel: &CancellationToken,
    ) -> BlobVerdict {
        if let Some((namespace, _)) = snapshot.roots.iter().find(|(_, s)| s.contains(&blob)) {
            debug!(blob = %blob, namespace = %namespace, "blob is a root");
            return BlobVerdict::Kept;
        }

        for namespace in &snapshot.namespaces {
            if cancel.is_cancelled() {
                return BlobVerdict::Skipped;
            }
            let from = snapshot
                .roots
                .get(namespace)
                .map_or(0, |state| state.resume_offset);
            match self
                .scanner
                .scan_tail_for_blob(
                    namespace,
                    from,
                    blob,
                    self.config.max_tail_rescan_records,
                    cancel,
                )
                .await
            {
                Ok(true) => {
                    debug!(blob = %blob, namespace = %namespace, "late add found in log tail");
                    return BlobVerdict::Kept;
                }
                Ok(false) => {}
                Err(GcError::Cancelled) => return BlobVerdict::Skipped,
                Err(err) => {
                    warn!(blob = %blob, namespace = %namespace, error = %err, "log tail re-scan failed; keeping blob");
                    return BlobVerdict::Kept;
                }
            }
        }

        if snapshot.remote.protects(&blob) {
            debug!(blob = %blob, "blob may still be referenced at a remote site");
            return BlobVerdict::Kept;
        }

        for guest in &snapshot.pool_guests {
            if cancel.is_cancelled() {
                return BlobVerdict::Skipped;
            }
            let referenced = match &self.index {
                Some(index) => index.is_referenced(guest, &blob).await,
                None => true,
            };
            if referenced {
                debug!(blob = %blob, namespace = %guest, "blob may be referenced by an index-tracked pool member");
                return BlobVerdict::Kept;
            }
        }

        delete_everywhere(self.blobs.as_ref(), &blob, &snapshot.namespaces).await
    }
}
