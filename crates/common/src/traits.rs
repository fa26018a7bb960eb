use anyhow::Result;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::{
    BlobId, BlobInfo, BlobListing, NamespaceId, NamespacePolicy, ObjectKey, ObjectRecord,
    PolicyError,
};

/// Result of a delete against an at-least-once store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// Someone else already removed it; callers treat this as success.
    NotFound,
}

/// Blob byte storage, addressed per namespace.
pub trait BlobStore: Send + Sync {
    fn exists<'a>(&'a self, namespace: &'a NamespaceId, blob: &'a BlobId)
        -> BoxFuture<'a, Result<bool>>;

    fn delete_object<'a>(
        &'a self,
        namespace: &'a NamespaceId,
        blob: &'a BlobId,
    ) -> BoxFuture<'a, Result<DeleteOutcome>>;

    fn list_objects<'a>(&'a self, namespace: &'a NamespaceId) -> BoxStream<'a, Result<BlobListing>>;

    /// Returns the subset of `blobs` the store does not hold.
    fn filter_out_known_blobs<'a>(
        &'a self,
        namespace: &'a NamespaceId,
        blobs: &'a [BlobId],
    ) -> BoxFuture<'a, Result<Vec<BlobId>>> {
        Box::pin(async move {
            let mut missing = Vec::new();
            for blob in blobs {
                if !self.exists(namespace, blob).await? {
                    missing.push(*blob);
                }
            }
            Ok(missing)
        })
    }
}

/// Object records plus the blob -> reference index.
pub trait ReferenceStore: Send + Sync {
    fn namespaces(&self) -> BoxFuture<'_, Result<Vec<NamespaceId>>>;

    /// `None` means the record itself is gone.
    fn get_record<'a>(
        &'a self,
        namespace: &'a NamespaceId,
        key: &'a ObjectKey,
    ) -> BoxFuture<'a, Result<Option<ObjectRecord>>>;

    fn records<'a>(&'a self, namespace: &'a NamespaceId) -> BoxStream<'a, Result<ObjectRecord>>;

    /// Returns whether a record was actually removed.
    fn delete_record<'a>(
        &'a self,
        namespace: &'a NamespaceId,
        key: &'a ObjectKey,
    ) -> BoxFuture<'a, Result<bool>>;

    fn blob_info<'a>(
        &'a self,
        namespace: &'a NamespaceId,
        blob: &'a BlobId,
    ) -> BoxFuture<'a, Result<BlobInfo>>;

    /// Last-access generations still holding records, oldest first.
    fn legacy_generations<'a>(&'a self, namespace: &'a NamespaceId)
        -> BoxFuture<'a, Result<Vec<u64>>>;

    fn legacy_generation_records<'a>(
        &'a self,
        namespace: &'a NamespaceId,
        generation: u64,
    ) -> BoxStream<'a, Result<ObjectRecord>>;
}

pub trait NamespacePolicyResolver: Send + Sync {
    fn policy(&self, namespace: &NamespaceId) -> std::result::Result<NamespacePolicy, PolicyError>;

    /// Namespaces carrying an explicit policy. Resolvers that derive
    /// policies on demand list none.
    fn configured_namespaces(&self) -> Vec<NamespaceId> {
        Vec::new()
    }
}

pub trait LeaderElection: Send + Sync {
    fn is_leader(&self) -> BoxFuture<'_, Result<bool>>;
}
