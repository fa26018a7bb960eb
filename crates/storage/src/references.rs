use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use common::{traits::ReferenceStore, BlobId, BlobInfo, NamespaceId, ObjectKey, ObjectRecord};
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};

/// Width of one legacy last-access generation.
pub const DEFAULT_GENERATION_SPAN: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Default)]
struct Inner {
    records: HashMap<NamespaceId, BTreeMap<ObjectKey, ObjectRecord>>,
    blob_index: HashMap<BlobId, BTreeSet<(NamespaceId, ObjectKey)>>,
    failing_lookups: HashSet<(NamespaceId, ObjectKey)>,
}

impl Inner {
    fn unindex(&mut self, record: &ObjectRecord) {
        for blob in &record.blobs {
            if let Some(refs) = self.blob_index.get_mut(blob) {
                refs.remove(&(record.namespace.clone(), record.key.clone()));
                if refs.is_empty() {
                    self.blob_index.remove(blob);
                }
            }
        }
    }
}

/// Object records and the blob -> reference index, kept in memory.
///
/// Legacy generations bucket records by last access time in
/// `generation_span` wide windows.
#[derive(Clone)]
pub struct InMemoryReferenceStore {
    inner: Arc<Mutex<Inner>>,
    generation_span: Duration,
}

impl Default for InMemoryReferenceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryReferenceStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            generation_span: DEFAULT_GENERATION_SPAN,
        }
    }

    pub fn with_generation_span(mut self, span: Duration) -> Self {
        self.generation_span = span.max(Duration::from_secs(1));
        self
    }

    pub fn generation_of(&self, last_access: SystemTime) -> u64 {
        let secs = last_access
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        secs / self.generation_span.as_secs().max(1)
    }

    /// Insert or replace a record and re-index its blobs.
    pub fn put_record(&self, record: ObjectRecord) -> Result<()> {
        let mut guard = self.lock()?;
        let previous = guard
            .records
            .get_mut(&record.namespace)
            .and_then(|records| records.remove(&record.key));
        if let Some(previous) = previous {
            guard.unindex(&previous);
        }
        for blob in &record.blobs {
            guard
                .blob_index
                .entry(*blob)
                .or_default()
                .insert((record.namespace.clone(), record.key.clone()));
        }
        guard
            .records
            .entry(record.namespace.clone())
            .or_default()
            .insert(record.key.clone(), record);
        Ok(())
    }

    /// Add an index entry without touching records, as a lagging index would.
    pub fn index_reference(&self, blob: BlobId, namespace: NamespaceId, key: ObjectKey) -> Result<()> {
        self.lock()?
            .blob_index
            .entry(blob)
            .or_default()
            .insert((namespace, key));
        Ok(())
    }

    /// Make `get_record` fail for this key.
    pub fn fail_lookups_for(&self, namespace: NamespaceId, key: ObjectKey) -> Result<()> {
        self.lock()?.failing_lookups.insert((namespace, key));
        Ok(())
    }

    pub fn record_count(&self, namespace: &NamespaceId) -> Result<usize> {
        Ok(self
            .lock()?
            .records
            .get(namespace)
            .map_or(0, |records| records.len()))
    }

    fn snapshot<F>(&self, namespace: &NamespaceId, keep: F) -> Result<Vec<ObjectRecord>>
    where
        F: Fn(&ObjectRecord) -> bool,
    {
        let guard = self.lock()?;
        Ok(guard
            .records
            .get(namespace)
            .map(|records| records.values().filter(|r| keep(r)).cloned().collect())
            .unwrap_or_default())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("in-memory reference store mutex poisoned"))
    }
}

fn into_stream<'a>(snapshot: Result<Vec<ObjectRecord>>) -> BoxStream<'a, Result<ObjectRecord>> {
    match snapshot {
        Ok(records) => stream::iter(records.into_iter().map(Ok)).boxed(),
        Err(err) => stream::once(async move { Err(err) }).boxed(),
    }
}

impl ReferenceStore for InMemoryReferenceStore {
    fn namespaces(&self) -> BoxFuture<'_, Result<Vec<NamespaceId>>> {
        Box::pin(async move {
            let mut names: Vec<_> = self.lock()?.records.keys().cloned().collect();
            names.sort();
            Ok(names)
        })
    }

    fn get_record<'a>(
        &'a self,
        namespace: &'a NamespaceId,
        key: &'a ObjectKey,
    ) -> BoxFuture<'a, Result<Option<ObjectRecord>>> {
        Box::pin(async move {
            let guard = self.lock()?;
            if guard
                .failing_lookups
                .contains(&(namespace.clone(), key.clone()))
            {
                return Err(anyhow!("lookup of {key} in {namespace} failed"));
            }
            Ok(guard
                .records
                .get(namespace)
                .and_then(|records| records.get(key))
                .cloned())
        })
    }

    fn records<'a>(&'a self, namespace: &'a NamespaceId) -> BoxStream<'a, Result<ObjectRecord>> {
        into_stream(self.snapshot(namespace, |_| true))
    }

    fn delete_record<'a>(
        &'a self,
        namespace: &'a NamespaceId,
        key: &'a ObjectKey,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let mut guard = self.lock()?;
            let removed = guard
                .records
                .get_mut(namespace)
                .and_then(|records| records.remove(key));
            match removed {
                Some(record) => {
                    guard.unindex(&record);
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    fn blob_info<'a>(
        &'a self,
        _namespace: &'a NamespaceId,
        blob: &'a BlobId,
    ) -> BoxFuture<'a, Result<BlobInfo>> {
        Box::pin(async move {
            let guard = self.lock()?;
            let references = guard
                .blob_index
                .get(blob)
                .map(|refs| refs.iter().cloned().collect())
                .unwrap_or_default();
            Ok(BlobInfo {
                blob: *blob,
                references,
            })
        })
    }

    fn legacy_generations<'a>(
        &'a self,
        namespace: &'a NamespaceId,
    ) -> BoxFuture<'a, Result<Vec<u64>>> {
        Box::pin(async move {
            let generations: BTreeSet<u64> = self
                .snapshot(namespace, |_| true)?
                .iter()
                .map(|record| self.generation_of(record.last_access))
                .collect();
            Ok(generations.into_iter().collect())
        })
    }

    fn legacy_generation_records<'a>(
        &'a self,
        namespace: &'a NamespaceId,
        generation: u64,
    ) -> BoxStream<'a, Result<ObjectRecord>> {
        into_stream(self.snapshot(namespace, |record| {
            self.generation_of(record.last_access) == generation
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn record(ns: &str, name: &str, blobs: Vec<BlobId>, age_secs: u64) -> ObjectRecord {
        ObjectRecord {
            namespace: NamespaceId::new(ns),
            key: ObjectKey::new("bucket", name),
            blobs,
            last_access: SystemTime::now() - Duration::from_secs(age_secs),
        }
    }

    #[tokio::test]
    async fn put_replaces_index_entries() {
        let store = InMemoryReferenceStore::new();
        let ns = NamespaceId::new("ns");
        let old = BlobId::of(b"old");
        let new = BlobId::of(b"new");

        store.put_record(record("ns", "k", vec![old], 0)).unwrap();
        store.put_record(record("ns", "k", vec![new], 0)).unwrap();

        assert!(store.blob_info(&ns, &old).await.unwrap().references.is_empty());
        assert_eq!(store.blob_info(&ns, &new).await.unwrap().references.len(), 1);
    }

    #[tokio::test]
    async fn delete_record_unindexes() {
        let store = InMemoryReferenceStore::new();
        let ns = NamespaceId::new("ns");
        let blob = BlobId::of(b"x");
        let key = ObjectKey::new("bucket", "k");
        store.put_record(record("ns", "k", vec![blob], 0)).unwrap();

        assert!(store.delete_record(&ns, &key).await.unwrap());
        assert!(!store.delete_record(&ns, &key).await.unwrap());
        assert!(store.get_record(&ns, &key).await.unwrap().is_none());
        assert!(store.blob_info(&ns, &blob).await.unwrap().references.is_empty());
    }

    #[tokio::test]
    async fn legacy_generations_are_ordered_buckets() {
        let store = InMemoryReferenceStore::new().with_generation_span(Duration::from_secs(100));
        let ns = NamespaceId::new("ns");
        store.put_record(record("ns", "recent", vec![], 0)).unwrap();
        store.put_record(record("ns", "old", vec![], 1_000)).unwrap();

        let generations = store.legacy_generations(&ns).await.unwrap();
        assert_eq!(generations.len(), 2);
        assert!(generations[0] < generations[1]);

        let oldest: Vec<ObjectRecord> = store
            .legacy_generation_records(&ns, generations[0])
            .try_collect()
            .await
            .unwrap();
        assert_eq!(oldest.len(), 1);
        assert_eq!(oldest[0].key.name, "old");
    }
}
