use std::time::{Duration, SystemTime};

use common::traits::{BlobStore, DeleteOutcome, NamespacePolicyResolver};
use common::{BlobId, CleanupStrategy, NamespaceId, NamespacePolicy, PolicyError};
use serde::Serialize;
use tracing::{debug, warn};

/// Outcome of evaluating one candidate blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobVerdict {
    Kept,
    Reclaimed,
    /// Unreferenced, but at least one namespace's delete failed.
    DeleteFailed,
    /// Not evaluated because the pass was cancelled.
    Skipped,
}

/// Summary of one collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectionReport {
    pub namespaces: usize,
    pub pools: usize,
    pub candidates: usize,
    pub kept: usize,
    pub reclaimed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl CollectionReport {
    pub fn record(&mut self, verdict: BlobVerdict) {
        match verdict {
            BlobVerdict::Kept => self.kept += 1,
            BlobVerdict::Reclaimed => self.reclaimed += 1,
            BlobVerdict::DeleteFailed => self.failed += 1,
            BlobVerdict::Skipped => self.skipped += 1,
        }
    }
}

/// Namespaces whose policy selects `strategy`. Namespaces without a policy
/// are left alone for this pass.
pub fn select_namespaces(
    policies: &dyn NamespacePolicyResolver,
    namespaces: impl IntoIterator<Item = NamespaceId>,
    strategy: CleanupStrategy,
) -> Vec<(NamespaceId, NamespacePolicy)> {
    let mut selected = Vec::new();
    for namespace in namespaces {
        match policies.policy(&namespace) {
            Ok(policy) if policy.strategy == strategy => selected.push((namespace, policy)),
            Ok(_) => {}
            Err(PolicyError::UnknownNamespace(_)) => {
                warn!(namespace = %namespace, "no cleanup policy configured; skipping namespace");
            }
            Err(err) => {
                warn!(namespace = %namespace, error = %err, "cleanup policy unavailable; skipping namespace");
            }
        }
    }
    selected
}

/// Blob old enough to be collected. Timestamps in the future count as young.
pub fn past_grace(last_modified: SystemTime, now: SystemTime, grace: Duration) -> bool {
    now.duration_since(last_modified)
        .map(|age| age >= grace)
        .unwrap_or(false)
}

/// Delete `blob` from every namespace, attempting all of them. "Not found"
/// counts as success.
pub async fn delete_everywhere(
    store: &dyn BlobStore,
    blob: &BlobId,
    namespaces: &[NamespaceId],
) -> BlobVerdict {
    let mut all_ok = true;
    for namespace in namespaces {
        match store.delete_object(namespace, blob).await {
            Ok(DeleteOutcome::Deleted) => {
                debug!(namespace = %namespace, blob = %blob, "deleted orphan blob");
            }
            Ok(DeleteOutcome::NotFound) => {
                debug!(namespace = %namespace, blob = %blob, "orphan blob already gone");
            }
            Err(err) => {
                all_ok = false;
                warn!(namespace = %namespace, blob = %blob, error = %err, "failed to delete orphan blob");
            }
        }
    }
    if all_ok {
        BlobVerdict::Reclaimed
    } else {
        BlobVerdict::DeleteFailed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::StaticPolicyResolver;

    #[test]
    fn selection_skips_unknown_and_other_strategy() {
        let resolver = StaticPolicyResolver::new()
            .with(NamespaceId::new("old"), NamespacePolicy::legacy())
            .with(NamespaceId::new("new"), NamespacePolicy::current_in_pool("p"));

        let names = ["old", "new", "mystery"].map(NamespaceId::new);
        let legacy = select_namespaces(&resolver, names.clone(), CleanupStrategy::Legacy);
        assert_eq!(legacy.len(), 1);
        assert_eq!(legacy[0].0, NamespaceId::new("old"));

        let current = select_namespaces(&resolver, names, CleanupStrategy::Current);
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].1.storage_pool.as_deref(), Some("p"));
    }

    #[test]
    fn grace_boundaries() {
        let now = SystemTime::now();
        let grace = Duration::from_secs(60);
        assert!(past_grace(now - Duration::from_secs(61), now, grace));
        assert!(!past_grace(now - Duration::from_secs(59), now, grace));
        assert!(!past_grace(now + Duration::from_secs(5), now, grace));
    }
}
