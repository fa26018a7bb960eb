use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use common::{BlobId, NamespaceId, ObjectKey};
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use txlog::{LogEntry, LogRegistry, TransactionEvent, TransactionLog, TxLogError};
use uuid::Uuid;

use crate::error::{GcError, GcResult};

/// Reachable blobs of one namespace as of `resume_offset`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcRootState {
    pub resume_offset: u64,
    pub generation_id: Uuid,
    pub roots: HashSet<BlobId>,
}

impl GcRootState {
    pub fn contains(&self, blob: &BlobId) -> bool {
        self.roots.contains(blob)
    }
}

/// Replay progress kept between passes.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScanProgress {
    generation_id: Uuid,
    pub(crate) resume_offset: u64,
    mapping: HashMap<ObjectKey, Vec<BlobId>>,
}

impl ScanProgress {
    fn fresh(generation_id: Uuid) -> Self {
        Self {
            generation_id,
            ..Self::default()
        }
    }

    pub(crate) fn apply(&mut self, namespace: &NamespaceId, entry: LogEntry) {
        match entry.event {
            TransactionEvent::Add { key, blobs, .. } => {
                if self.mapping.contains_key(&key) {
                    debug!(
                        namespace = %namespace,
                        key = %key,
                        offset = entry.offset,
                        "object re-published; later add replaces earlier blobs"
                    );
                }
                self.mapping.insert(key, blobs);
            }
            TransactionEvent::Remove { key, .. } => {
                self.mapping.remove(&key);
            }
        }
        self.resume_offset = entry.next_offset;
    }

    pub(crate) fn to_state(&self) -> GcRootState {
        GcRootState {
            resume_offset: self.resume_offset,
            generation_id: self.generation_id,
            roots: self.mapping.values().flatten().copied().collect(),
        }
    }
}

/// Computes per-namespace root sets by replaying transaction logs, resuming
/// from the previous pass while the log generation is unchanged.
pub struct RootScanner {
    registry: Arc<LogRegistry>,
    page_size: usize,
    progress: Mutex<HashMap<NamespaceId, ScanProgress>>,
}

impl RootScanner {
    pub fn new(registry: Arc<LogRegistry>, page_size: usize) -> Self {
        Self {
            registry,
            page_size: page_size.max(1),
            progress: Mutex::new(HashMap::new()),
        }
    }

    #[instrument(skip(self, namespace, cancel), fields(namespace = %namespace))]
    pub async fn compute_roots(
        &self,
        namespace: &NamespaceId,
        cancel: &CancellationToken,
    ) -> GcResult<GcRootState> {
        let Some(log) = self.log_for(namespace)? else {
            return Ok(GcRootState::default());
        };

        let cached = self.take_progress(namespace);
        let page_size = self.page_size;
        let cancel = cancel.clone();
        let progress =
            spawn_blocking(move || replay(&log, cached, page_size, &cancel)).await??;

        let state = progress.to_state();
        debug!(
            resume_offset = state.resume_offset,
            roots = state.roots.len(),
            generation = %state.generation_id,
            "root scan complete"
        );
        if let Ok(mut cache) = self.progress.lock() {
            cache.insert(namespace.clone(), progress);
        }
        Ok(state)
    }

    /// True when an add referencing `blob` appears within `max_records`
    /// records from `from_offset`.
    pub async fn scan_tail_for_blob(
        &self,
        namespace: &NamespaceId,
        from_offset: u64,
        blob: BlobId,
        max_records: usize,
        cancel: &CancellationToken,
    ) -> GcResult<bool> {
        let Some(log) = self.log_for(namespace)? else {
            return Ok(false);
        };
        let page_size = self.page_size;
        let cancel = cancel.clone();

        spawn_blocking(move || {
            let mut offset = from_offset;
            let mut examined = 0usize;
            while examined < max_records {
                if cancel.is_cancelled() {
                    return Err(GcError::Cancelled);
                }
                let want = page_size.min(max_records - examined);
                let batch = match log.read(offset, want, None) {
                    Ok(batch) => batch,
                    Err(err) if err.is_empty_log() => return Ok(false),
                    Err(source) => {
                        return Err(GcError::RootScan {
                            namespace: log.namespace().clone(),
                            source,
                        })
                    }
                };
                let count = batch.entries.len();
                if batch.entries.iter().any(|e| e.event.references(&blob)) {
                    return Ok(true);
                }
                examined += count;
                offset = batch.next_offset;
                if count < want {
                    break;
                }
            }
            Ok(false)
        })
        .await?
    }

    /// Drop cached progress so the next scan replays from the start.
    pub fn forget(&self, namespace: &NamespaceId) {
        if let Ok(mut cache) = self.progress.lock() {
            cache.remove(namespace);
        }
    }

    fn log_for(&self, namespace: &NamespaceId) -> GcResult<Option<Arc<TransactionLog>>> {
        self.registry
            .get(namespace)
            .map_err(|source| GcError::RootScan {
                namespace: namespace.clone(),
                source,
            })
    }

    fn take_progress(&self, namespace: &NamespaceId) -> Option<ScanProgress> {
        match self.progress.lock() {
            Ok(mut cache) => cache.remove(namespace),
            Err(_) => {
                warn!(namespace = %namespace, "root scan cache poisoned; replaying from start");
                None
            }
        }
    }
}

fn replay(
    log: &TransactionLog,
    cached: Option<ScanProgress>,
    page_size: usize,
    cancel: &CancellationToken,
) -> GcResult<ScanProgress> {
    let namespace = log.namespace().clone();
    let scan_error = |source: TxLogError| GcError::RootScan {
        namespace: namespace.clone(),
        source,
    };

    let generation = log.generation_id().map_err(scan_error)?;
    let mut progress = match cached {
        Some(progress) if progress.generation_id == generation => progress,
        Some(stale) => {
            debug!(
                namespace = %namespace,
                cached = %stale.generation_id,
                current = %generation,
                "log generation changed; replaying from start"
            );
            ScanProgress::fresh(generation)
        }
        None => ScanProgress::fresh(generation),
    };

    loop {
        if cancel.is_cancelled() {
            return Err(GcError::Cancelled);
        }
        let batch = match log.read(progress.resume_offset, page_size, None) {
            Ok(batch) => batch,
            Err(err) if err.is_empty_log() => break,
            Err(source) => return Err(scan_error(source)),
        };

        let count = batch.entries.len();
        for entry in batch.entries {
            progress.apply(&namespace, entry);
        }
        if let Some(at) = batch.mismatch_at {
            debug!(namespace = %namespace, offset = at, "writer mid-append; scan stops here");
            break;
        }
        if count < page_size {
            break;
        }
    }

    Ok(progress)
}
