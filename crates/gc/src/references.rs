use std::sync::Arc;
use std::time::SystemTime;

use common::traits::{NamespacePolicyResolver, ReferenceStore};
use common::{CleanupStrategy, NamespaceId, ObjectRecord, PolicyError};
use futures::future::{join_all, BoxFuture};
use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use txlog::{LogRegistry, TransactionEvent};

use crate::config::GcConfig;
use crate::error::{GcError, GcResult};

/// Removes expired object records of one namespace and returns how many
/// were removed.
pub trait NamespaceCleanup: Send + Sync {
    fn strategy(&self) -> CleanupStrategy;

    fn cleanup<'a>(
        &'a self,
        namespace: &'a NamespaceId,
        cutoff: SystemTime,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, GcResult<usize>>;
}

/// Deletes a record and logs its removal so other sites converge.
#[derive(Clone)]
pub struct RecordReaper {
    references: Arc<dyn ReferenceStore>,
    registry: Arc<LogRegistry>,
    local_site: String,
}

impl RecordReaper {
    pub fn new(
        references: Arc<dyn ReferenceStore>,
        registry: Arc<LogRegistry>,
        local_site: impl Into<String>,
    ) -> Self {
        Self {
            references,
            registry,
            local_site: local_site.into(),
        }
    }

    /// Returns false when the record was already gone. The record is deleted
    /// before the remove is logged, so a failed append leaves the log
    /// over-reporting references, never under-reporting them.
    pub async fn reap(&self, record: &ObjectRecord) -> GcResult<bool> {
        let removed = self
            .references
            .delete_record(&record.namespace, &record.key)
            .await
            .map_err(|err| GcError::store("delete_record", err))?;
        if !removed {
            return Ok(false);
        }

        let registry = self.registry.clone();
        let namespace = record.namespace.clone();
        let key = record.key.clone();
        let site = self.local_site.clone();
        spawn_blocking(move || {
            let log = registry.get_or_create(&namespace)?;
            let seen = log.site_mask([site.as_str()])?;
            log.append(&TransactionEvent::remove(key).seen_at(seen))
        })
        .await?
        .map_err(|source| GcError::Log {
            namespace: record.namespace.clone(),
            source,
        })?;

        debug!(namespace = %record.namespace, key = %record.key, "expired object record removed");
        Ok(true)
    }
}

fn expired(record: &ObjectRecord, cutoff: SystemTime) -> bool {
    record.last_access < cutoff
}

/// Bulk path for index-tracked namespaces: gather expired records, then
/// remove them concurrently.
pub struct CurrentCleanup {
    references: Arc<dyn ReferenceStore>,
    reaper: RecordReaper,
    parallelism: usize,
}

impl CurrentCleanup {
    pub fn new(references: Arc<dyn ReferenceStore>, reaper: RecordReaper, parallelism: usize) -> Self {
        Self {
            references,
            reaper,
            parallelism: parallelism.max(1),
        }
    }

    async fn run(
        &self,
        namespace: &NamespaceId,
        cutoff: SystemTime,
        cancel: &CancellationToken,
    ) -> GcResult<usize> {
        let mut expired_records = Vec::new();
        let mut records = self.references.records(namespace);
        while let Some(record) = records.next().await {
            if cancel.is_cancelled() {
                debug!(namespace = %namespace, gathered = expired_records.len(), "cleanup cancelled while gathering records");
                return Ok(0);
            }
            match record {
                Ok(record) if expired(&record, cutoff) => expired_records.push(record),
                Ok(_) => {}
                Err(err) => {
                    warn!(namespace = %namespace, error = %err, "failed to read object record; skipping");
                }
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut handles = Vec::with_capacity(expired_records.len());
        for record in expired_records {
            if cancel.is_cancelled() {
                break;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| GcError::Cancelled)?;
            let reaper = self.reaper.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let outcome = reaper.reap(&record).await;
                (record, outcome)
            }));
        }

        let mut removed = 0usize;
        for joined in join_all(handles).await {
            match joined {
                Ok((_, Ok(true))) => removed += 1,
                Ok((_, Ok(false))) => {}
                Ok((record, Err(err))) => {
                    warn!(namespace = %namespace, key = %record.key, error = %err, "failed to remove expired record");
                }
                Err(err) => error!(namespace = %namespace, error = %err, "record cleanup task failed"),
            }
        }
        Ok(removed)
    }
}

impl NamespaceCleanup for CurrentCleanup {
    fn strategy(&self) -> CleanupStrategy {
        CleanupStrategy::Current
    }

    fn cleanup<'a>(
        &'a self,
        namespace: &'a NamespaceId,
        cutoff: SystemTime,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, GcResult<usize>> {
        Box::pin(self.run(namespace, cutoff, cancel))
    }
}

/// Sequential path for log-replayed namespaces: walk last-access
/// generations oldest first.
pub struct LegacyCleanup {
    references: Arc<dyn ReferenceStore>,
    reaper: RecordReaper,
}

impl LegacyCleanup {
    pub fn new(references: Arc<dyn ReferenceStore>, reaper: RecordReaper) -> Self {
        Self { references, reaper }
    }

    async fn run(
        &self,
        namespace: &NamespaceId,
        cutoff: SystemTime,
        cancel: &CancellationToken,
    ) -> GcResult<usize> {
        let generations = self
            .references
            .legacy_generations(namespace)
            .await
            .map_err(|err| GcError::store("legacy_generations", err))?;

        let mut removed = 0usize;
        for generation in generations {
            let mut records = self.references.legacy_generation_records(namespace, generation);
            while let Some(record) = records.next().await {
                if cancel.is_cancelled() {
                    return Ok(removed);
                }
                let record = match record {
                    Ok(record) => record,
                    Err(err) => {
                        warn!(namespace = %namespace, generation, error = %err, "failed to read object record; skipping");
                        continue;
                    }
                };
                if !expired(&record, cutoff) {
                    continue;
                }
                match self.reaper.reap(&record).await {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(err) => {
                        warn!(namespace = %namespace, key = %record.key, error = %err, "failed to remove expired record");
                    }
                }
            }
        }
        Ok(removed)
    }
}

impl NamespaceCleanup for LegacyCleanup {
    fn strategy(&self) -> CleanupStrategy {
        CleanupStrategy::Legacy
    }

    fn cleanup<'a>(
        &'a self,
        namespace: &'a NamespaceId,
        cutoff: SystemTime,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, GcResult<usize>> {
        Box::pin(self.run(namespace, cutoff, cancel))
    }
}

/// Picks the cleanup implementation named by each namespace's policy.
pub struct ReferenceCleaner {
    current: Arc<dyn NamespaceCleanup>,
    legacy: Arc<dyn NamespaceCleanup>,
    policies: Arc<dyn NamespacePolicyResolver>,
    default_cutoff: std::time::Duration,
}

impl ReferenceCleaner {
    pub fn new(
        current: Arc<dyn NamespaceCleanup>,
        legacy: Arc<dyn NamespaceCleanup>,
        policies: Arc<dyn NamespacePolicyResolver>,
        config: &GcConfig,
    ) -> Self {
        Self {
            current,
            legacy,
            policies,
            default_cutoff: config.last_access_cutoff,
        }
    }

    /// Standard wiring: both paths over one reference store and log registry.
    pub fn with_stores(
        references: Arc<dyn ReferenceStore>,
        registry: Arc<LogRegistry>,
        policies: Arc<dyn NamespacePolicyResolver>,
        config: &GcConfig,
    ) -> Self {
        let reaper = RecordReaper::new(references.clone(), registry, config.local_site.clone());
        let current = Arc::new(CurrentCleanup::new(
            references.clone(),
            reaper.clone(),
            config.blob_parallelism,
        ));
        let legacy = Arc::new(LegacyCleanup::new(references, reaper));
        Self::new(current, legacy, policies, config)
    }

    fn implementation(&self, strategy: CleanupStrategy) -> &dyn NamespaceCleanup {
        match strategy {
            CleanupStrategy::Current => self.current.as_ref(),
            CleanupStrategy::Legacy => self.legacy.as_ref(),
        }
    }

    #[instrument(skip(self, namespace, cancel), fields(namespace = %namespace))]
    pub async fn cleanup_namespace(
        &self,
        namespace: &NamespaceId,
        cancel: &CancellationToken,
    ) -> GcResult<usize> {
        let policy = match self.policies.policy(namespace) {
            Ok(policy) => policy,
            Err(PolicyError::UnknownNamespace(_)) => {
                warn!("no cleanup policy configured; skipping namespace");
                return Ok(0);
            }
            Err(err) => {
                warn!(error = %err, "cleanup policy unavailable; skipping namespace");
                return Ok(0);
            }
        };

        let max_age = policy.last_access_cutoff().unwrap_or(self.default_cutoff);
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let cleanup = self.implementation(policy.strategy);

        let removed = cleanup.cleanup(namespace, cutoff, cancel).await?;
        info!(
            strategy = ?cleanup.strategy(),
            removed,
            max_age_secs = max_age.as_secs(),
            "reference cleanup complete"
        );
        Ok(removed)
    }
}
