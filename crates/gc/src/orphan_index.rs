use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::SystemTime;

use common::traits::{BlobStore, NamespacePolicyResolver, ReferenceStore};
use common::{BlobId, CleanupStrategy, NamespaceId, ObjectKey};
use futures::future::join_all;
use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::GcConfig;
use crate::error::{GcError, GcResult};
use crate::sweep::{delete_everywhere, past_grace, select_namespaces, BlobVerdict, CollectionReport};

/// How one index entry for a blob resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceCheck {
    /// Record exists and still lists the blob.
    Live,
    /// Record exists and lists the blob, but some of its blobs are missing
    /// from storage. Still a reference.
    LiveWithMissingBlobs,
    /// Record gone, or it no longer lists the blob.
    Stale,
    /// Lookup failed; assumed live.
    Unknown,
}

impl ReferenceCheck {
    pub fn keeps_blob(self) -> bool {
        !matches!(self, ReferenceCheck::Stale)
    }
}

/// Collects blobs of index-tracked (current) namespaces, one storage pool at
/// a time.
#[derive(Clone)]
pub struct IndexOrphanCollector {
    references: Arc<dyn ReferenceStore>,
    blobs: Arc<dyn BlobStore>,
    policies: Arc<dyn NamespacePolicyResolver>,
    config: GcConfig,
}

impl IndexOrphanCollector {
    pub fn new(
        references: Arc<dyn ReferenceStore>,
        blobs: Arc<dyn BlobStore>,
        policies: Arc<dyn NamespacePolicyResolver>,
        config: GcConfig,
    ) -> Self {
        Self {
            references,
            blobs,
            policies,
            config,
        }
    }

    /// Pools of current-strategy namespaces known to the reference store.
    pub async fn pools(&self) -> GcResult<BTreeMap<String, Vec<NamespaceId>>> {
        let namespaces = self
            .references
            .namespaces()
            .await
            .map_err(|err| GcError::store("namespaces", err))?;

        let mut pools: BTreeMap<String, Vec<NamespaceId>> = BTreeMap::new();
        for (namespace, policy) in
            select_namespaces(self.policies.as_ref(), namespaces, CleanupStrategy::Current)
        {
            pools
                .entry(policy.pool_for(&namespace))
                .or_default()
                .push(namespace);
        }
        Ok(pools)
    }

    #[instrument(skip_all)]
    pub async fn collect(&self, cancel: &CancellationToken) -> GcResult<CollectionReport> {
        let pools = self.pools().await?;
        let mut report = CollectionReport {
            pools: pools.len(),
            namespaces: pools.values().map(Vec::len).sum(),
            ..CollectionReport::default()
        };

        for (pool, members) in pools {
            if cancel.is_cancelled() {
                return Err(GcError::Cancelled);
            }
            self.collect_pool(&pool, Arc::new(members), &mut report, cancel)
                .await?;
        }

        info!(
            pools = report.pools,
            namespaces = report.namespaces,
            candidates = report.candidates,
            kept = report.kept,
            reclaimed = report.reclaimed,
            failed = report.failed,
            "index-based collection pass complete"
        );
        Ok(report)
    }

    async fn collect_pool(
        &self,
        pool: &str,
        members: Arc<Vec<NamespaceId>>,
        report: &mut CollectionReport,
        cancel: &CancellationToken,
    ) -> GcResult<()> {
        let candidates = self.list_pool_candidates(pool, &members).await;
        report.candidates += candidates.len();
        debug!(pool, namespaces = members.len(), candidates = candidates.len(), "collecting storage pool");

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
            let members = members.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                collector.evaluate(blob, &members, &cancel).await
            }));
        }

        for joined in join_all(handles).await {
            match joined {
                Ok(verdict) => report.record(verdict),
                Err(err) => {
                    error!(pool, error = %err, "blob evaluation task failed");
                    report.failed += 1;
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(GcError::Cancelled);
        }
        Ok(())
    }

    /// Pool members share storage, so one listing covers them all.
    async fn list_pool_candidates(&self, pool: &str, members: &[NamespaceId]) -> BTreeSet<BlobId> {
        let mut candidates = BTreeSet::new();
        let Some(lister) = members.first() else {
            return candidates;
        };

        let now = SystemTime::now();
        let mut listing = self.blobs.list_objects(lister);
        while let Some(item) = listing.next().await {
            match item {
                Ok(blob) if past_grace(blob.last_modified, now, self.config.grace_period) => {
                    candidates.insert(blob.blob);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(pool, namespace = %lister, error = %err, "blob listing failed; pool contributes no further candidates");
                    break;
                }
            }
        }
        candidates
    }

    async fn evaluate(
        &self,
        blob: BlobId,
        members: &[NamespaceId],
        cancel: &CancellationToken,
    ) -> BlobVerdict {
        for namespace in members {
            if cancel.is_cancelled() {
                return BlobVerdict::Skipped;
            }
            if self.is_referenced(namespace, &blob).await {
                return BlobVerdict::Kept;
            }
        }

        delete_everywhere(self.blobs.as_ref(), &blob, members).await
    }

    /// True unless every index entry `namespace` holds for `blob` resolves
    /// as stale. A failed index lookup counts as referenced.
    pub async fn is_referenced(&self, namespace: &NamespaceId, blob: &BlobId) -> bool {
        let info = match self.references.blob_info(namespace, blob).await {
            Ok(info) => info,
            Err(err) => {
                warn!(namespace = %namespace, blob = %blob, error = %err, "blob index lookup failed; keeping blob");
                return true;
            }
        };

        for (owner, key) in info.references.iter().filter(|(owner, _)| owner == namespace) {
            let check = self.check_reference(owner, key, blob).await;
            debug!(namespace = %owner, key = %key, blob = %blob, ?check, "resolved index entry");
            if check.keeps_blob() {
                return true;
            }
        }
        false
    }

    pub async fn check_reference(
        &self,
        namespace: &NamespaceId,
        key: &ObjectKey,
        blob: &BlobId,
    ) -> ReferenceCheck {
        let record = match self.references.get_record(namespace, key).await {
            Ok(Some(record)) => record,
            Ok(None) => return ReferenceCheck::Stale,
            Err(err) => {
                warn!(namespace = %namespace, key = %key, error = %err, "record lookup failed; treating reference as live");
                return ReferenceCheck::Unknown;
            }
        };
        if !record.blobs.contains(blob) {
            return ReferenceCheck::Stale;
        }

        match self
            .blobs
            .filter_out_known_blobs(namespace, &record.blobs)
            .await
        {
            Ok(missing) if missing.is_empty() => ReferenceCheck::Live,
            Ok(missing) => {
                warn!(
                    namespace = %namespace,
                    key = %key,
                    missing = missing.len(),
                    "record references blobs absent from storage"
                );
                ReferenceCheck::LiveWithMissingBlobs
            }
            Err(err) => {
                debug!(namespace = %namespace, key = %key, error = %err, "blob presence check failed");
                ReferenceCheck::Live
            }
        }
    }
}
