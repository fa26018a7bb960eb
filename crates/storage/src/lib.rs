use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context, Result};
use common::{
    traits::{BlobStore, DeleteOutcome},
    BlobId, BlobListing, NamespaceId,
};
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::debug;

pub mod leader;
pub mod references;

pub use leader::LeaderFlag;
pub use references::InMemoryReferenceStore;

struct StoredBlob {
    len: usize,
    last_modified: SystemTime,
}

#[derive(Default)]
struct Inner {
    pools: HashMap<String, HashMap<BlobId, StoredBlob>>,
    aliases: HashMap<NamespaceId, String>,
    failing_deletes: HashSet<BlobId>,
    deletions: Vec<(NamespaceId, BlobId)>,
}

impl Inner {
    fn pool_name(&self, namespace: &NamespaceId) -> String {
        self.aliases
            .get(namespace)
            .cloned()
            .unwrap_or_else(|| namespace.as_str().to_string())
    }
}

/// In-memory blob store used for testing and scaffolding.
///
/// Namespaces mapped to the same pool share one set of blobs, the way several
/// namespaces can sit on one physical bucket.
#[derive(Clone, Default)]
pub struct InMemoryBlobStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign_pool(&self, namespace: &NamespaceId, pool: impl Into<String>) -> Result<()> {
        self.lock()?.aliases.insert(namespace.clone(), pool.into());
        Ok(())
    }

    pub fn put(&self, namespace: &NamespaceId, data: &[u8]) -> Result<BlobId> {
        self.put_aged(namespace, data, Duration::ZERO)
    }

    /// Store `data` with a modification time `age` in the past.
    pub fn put_aged(&self, namespace: &NamespaceId, data: &[u8], age: Duration) -> Result<BlobId> {
        let blob = BlobId::of(data);
        let last_modified = SystemTime::now()
            .checked_sub(age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut guard = self.lock()?;
        let pool = guard.pool_name(namespace);
        guard.pools.entry(pool).or_default().insert(
            blob,
            StoredBlob {
                len: data.len(),
                last_modified,
            },
        );
        Ok(blob)
    }

    pub fn contains(&self, namespace: &NamespaceId, blob: &BlobId) -> Result<bool> {
        let guard = self.lock()?;
        let pool = guard.pool_name(namespace);
        Ok(guard
            .pools
            .get(&pool)
            .map_or(false, |blobs| blobs.contains_key(blob)))
    }

    pub fn stored_bytes(&self, namespace: &NamespaceId) -> Result<usize> {
        let guard = self.lock()?;
        let pool = guard.pool_name(namespace);
        Ok(guard
            .pools
            .get(&pool)
            .map_or(0, |blobs| blobs.values().map(|b| b.len).sum()))
    }

    /// Make every delete of `blob` fail, to exercise partial-failure paths.
    pub fn fail_deletes_of(&self, blob: BlobId) -> Result<()> {
        self.lock()?.failing_deletes.insert(blob);
        Ok(())
    }

    /// Every delete issued so far, including failed and already-gone ones.
    pub fn deletions(&self) -> Result<Vec<(NamespaceId, BlobId)>> {
        Ok(self.lock()?.deletions.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("in-memory blob store mutex poisoned"))
    }
}

impl BlobStore for InMemoryBlobStore {
    fn exists<'a>(
        &'a self,
        namespace: &'a NamespaceId,
        blob: &'a BlobId,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { self.contains(namespace, blob) })
    }

    fn delete_object<'a>(
        &'a self,
        namespace: &'a NamespaceId,
        blob: &'a BlobId,
    ) -> BoxFuture<'a, Result<DeleteOutcome>> {
        Box::pin(async move {
            let mut guard = self.lock()?;
            guard.deletions.push((namespace.clone(), *blob));
            if guard.failing_deletes.contains(blob) {
                return Err(anyhow!("delete of {blob} in {namespace} rejected"));
            }
            let pool = guard.pool_name(namespace);
            let removed = guard
                .pools
                .get_mut(&pool)
                .and_then(|blobs| blobs.remove(blob));
            Ok(match removed {
                Some(_) => DeleteOutcome::Deleted,
                None => DeleteOutcome::NotFound,
            })
        })
    }

    fn list_objects<'a>(&'a self, namespace: &'a NamespaceId) -> BoxStream<'a, Result<BlobListing>> {
        let snapshot = self.lock().map(|guard| {
            let pool = guard.pool_name(namespace);
            let mut listing: Vec<BlobListing> = guard
                .pools
                .get(&pool)
                .map(|blobs| {
                    blobs
                        .iter()
                        .map(|(blob, stored)| BlobListing {
                            blob: *blob,
                            last_modified: stored.last_modified,
                        })
                        .collect()
                })
                .unwrap_or_default();
            listing.sort_by(|a, b| a.blob.cmp(&b.blob));
            listing
        });

        match snapshot {
            Ok(listing) => stream::iter(listing.into_iter().map(Ok)).boxed(),
            Err(err) => stream::once(async move { Err(err) }).boxed(),
        }
    }
}

/// Blob store over a local directory: `<root>/<pool>/<blob hex>`.
#[derive(Clone, Debug)]
pub struct FsBlobStore {
    root: PathBuf,
    aliases: HashMap<NamespaceId, String>,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            aliases: HashMap::new(),
        }
    }

    pub fn with_pool(mut self, namespace: NamespaceId, pool: impl Into<String>) -> Self {
        self.aliases.insert(namespace, pool.into());
        self
    }

    pub fn namespace_dir(&self, namespace: &NamespaceId) -> PathBuf {
        match self.aliases.get(namespace) {
            Some(pool) => self.root.join(pool),
            None => self.root.join(namespace.as_str()),
        }
    }

    fn blob_path(&self, namespace: &NamespaceId, blob: &BlobId) -> PathBuf {
        self.namespace_dir(namespace).join(blob.to_hex())
    }

    pub async fn put(&self, namespace: &NamespaceId, data: &[u8]) -> Result<BlobId> {
        let blob = BlobId::of(data);
        let dir = self.namespace_dir(namespace);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating blob directory {}", dir.display()))?;
        let path = dir.join(blob.to_hex());
        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("writing blob {}", path.display()))?;
        Ok(blob)
    }
}

impl BlobStore for FsBlobStore {
    fn exists<'a>(
        &'a self,
        namespace: &'a NamespaceId,
        blob: &'a BlobId,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let path = self.blob_path(namespace, blob);
            tokio::fs::try_exists(&path)
                .await
                .with_context(|| format!("checking blob {}", path.display()))
        })
    }

    fn delete_object<'a>(
        &'a self,
        namespace: &'a NamespaceId,
        blob: &'a BlobId,
    ) -> BoxFuture<'a, Result<DeleteOutcome>> {
        Box::pin(async move {
            let path = self.blob_path(namespace, blob);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(DeleteOutcome::Deleted),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(DeleteOutcome::NotFound),
                Err(err) => {
                    Err(err).with_context(|| format!("deleting blob {}", path.display()))
                }
            }
        })
    }

    fn list_objects<'a>(&'a self, namespace: &'a NamespaceId) -> BoxStream<'a, Result<BlobListing>> {
        let dir = self.namespace_dir(namespace);
        stream::once(scan_blob_dir(dir))
            .flat_map(|scanned| match scanned {
                Ok(listing) => stream::iter(listing.into_iter().map(Ok)).boxed(),
                Err(err) => stream::once(async move { Err(err) }).boxed(),
            })
            .boxed()
    }
}

async fn scan_blob_dir(dir: PathBuf) -> Result<Vec<BlobListing>> {
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("listing blobs in {}", dir.display()))
        }
    };

    let mut listing = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(blob) = name.to_str().and_then(|n| n.parse::<BlobId>().ok()) else {
            debug!(path = %entry.path().display(), "ignoring non-blob file");
            continue;
        };
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        listing.push(BlobListing {
            blob,
            last_modified: metadata.modified()?,
        });
    }
    listing.sort_by(|a, b| a.blob.cmp(&b.blob));
    Ok(listing)
}
