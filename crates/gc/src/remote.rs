use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use common::{BlobId, NamespaceId};
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use txlog::ReadBatch;

use crate::error::{GcError, GcResult};
use crate::roots::ScanProgress;

/// Transaction logs held by another site.
pub trait RemoteLogSource: Send + Sync {
    /// Name used in logs.
    fn site(&self) -> String;

    /// One page of `namespace`'s log from `offset`, with local read cursor
    /// semantics. `None` when the site holds no log for the namespace.
    fn read_page<'a>(
        &'a self,
        namespace: &'a NamespaceId,
        offset: u64,
        count: usize,
    ) -> BoxFuture<'a, Result<Option<ReadBatch>>>;
}

/// Blobs still reachable at remote sites, or `complete == false` when some
/// site could not be read to the end.
#[derive(Debug, Clone, Default)]
pub struct RemoteRoots {
    pub roots: HashSet<BlobId>,
    pub complete: bool,
}

impl RemoteRoots {
    /// Whether a blob outside `roots` may be treated as unreachable remotely.
    pub fn protects(&self, blob: &BlobId) -> bool {
        !self.complete || self.roots.contains(blob)
    }
}

/// Replay `namespace`'s log at `source` from the start and return the blobs
/// its live objects reference.
pub async fn replay_remote(
    source: &dyn RemoteLogSource,
    namespace: &NamespaceId,
    page_size: usize,
    cancel: &CancellationToken,
) -> GcResult<HashSet<BlobId>> {
    let page_size = page_size.max(1);
    let mut progress = ScanProgress::default();

    loop {
        if cancel.is_cancelled() {
            return Err(GcError::Cancelled);
        }
        let offset = progress.resume_offset;
        let batch = source
            .read_page(namespace, offset, page_size)
            .await
            .map_err(|err| GcError::store("remote_read", err))?;
        let Some(batch) = batch else {
            debug!(site = %source.site(), namespace = %namespace, "no log at remote site");
            break;
        };

        let count = batch.entries.len();
        for entry in batch.entries {
            progress.apply(namespace, entry);
        }
        if let Some(at) = batch.mismatch_at {
            debug!(site = %source.site(), namespace = %namespace, offset = at, "remote writer mid-append; replay stops here");
            break;
        }
        if count == 0 || progress.resume_offset == offset {
            break;
        }
    }

    Ok(progress.to_state().roots)
}

/// Union of remote roots over every source and namespace. Any failed read
/// leaves the result incomplete, which keeps every candidate.
pub async fn collect_remote_roots(
    sources: &[Arc<dyn RemoteLogSource>],
    namespaces: &[NamespaceId],
    page_size: usize,
    cancel: &CancellationToken,
) -> GcResult<RemoteRoots> {
    let mut remote = RemoteRoots {
        roots: HashSet::new(),
        complete: true,
    };
    for source in sources {
        for namespace in namespaces {
            match replay_remote(source.as_ref(), namespace, page_size, cancel).await {
                Ok(roots) => remote.roots.extend(roots),
                Err(GcError::Cancelled) => return Err(GcError::Cancelled),
                Err(err) => {
                    warn!(site = %source.site(), namespace = %namespace, error = %err, "remote log unavailable; keeping unrooted blobs this pass");
                    remote.complete = false;
                }
            }
        }
    }
    Ok(remote)
}
