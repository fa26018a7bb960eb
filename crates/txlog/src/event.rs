use bytes::Bytes;
use common::{BlobId, ObjectKey};
use serde::{Deserialize, Serialize};

/// Number of replication sites a mask can describe.
pub const MAX_SITES: usize = 64;

/// Set of replication sites (by bit position) that already observed an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteMask(pub u64);

impl SiteMask {
    pub const EMPTY: SiteMask = SiteMask(0);

    pub fn contains(&self, bit: u8) -> bool {
        (bit as usize) < MAX_SITES && self.0 & (1u64 << bit) != 0
    }

    pub fn with(self, bit: u8) -> Self {
        debug_assert!((bit as usize) < MAX_SITES);
        SiteMask(self.0 | (1u64 << bit))
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// One add/remove of an object reference. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransactionEvent {
    Add {
        key: ObjectKey,
        blobs: Vec<BlobId>,
        sites: SiteMask,
        #[serde(default)]
        metadata: Option<Bytes>,
    },
    Remove {
        key: ObjectKey,
        sites: SiteMask,
    },
}

impl TransactionEvent {
    pub fn add(key: ObjectKey, blobs: Vec<BlobId>) -> Self {
        TransactionEvent::Add {
            key,
            blobs,
            sites: SiteMask::EMPTY,
            metadata: None,
        }
    }

    pub fn remove(key: ObjectKey) -> Self {
        TransactionEvent::Remove {
            key,
            sites: SiteMask::EMPTY,
        }
    }

    pub fn seen_at(mut self, mask: SiteMask) -> Self {
        match &mut self {
            TransactionEvent::Add { sites, .. } | TransactionEvent::Remove { sites, .. } => {
                *sites = mask
            }
        }
        self
    }

    /// Attach opaque metadata. Ignored for removes.
    pub fn with_metadata(mut self, payload: impl Into<Bytes>) -> Self {
        if let TransactionEvent::Add { metadata, .. } = &mut self {
            *metadata = Some(payload.into());
        }
        self
    }

    pub fn key(&self) -> &ObjectKey {
        match self {
            TransactionEvent::Add { key, .. } | TransactionEvent::Remove { key, .. } => key,
        }
    }

    pub fn sites(&self) -> SiteMask {
        match self {
            TransactionEvent::Add { sites, .. } | TransactionEvent::Remove { sites, .. } => *sites,
        }
    }

    pub fn is_add(&self) -> bool {
        matches!(self, TransactionEvent::Add { .. })
    }

    /// True for an add that points the key at `blob`.
    pub fn references(&self, blob: &BlobId) -> bool {
        match self {
            TransactionEvent::Add { blobs, .. } => blobs.contains(blob),
            TransactionEvent::Remove { .. } => false,
        }
    }
}

/// A decoded event plus its position in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Byte offset of the record header.
    pub offset: u64,
    /// Offset of the record that follows; resume reading here.
    pub next_offset: u64,
    pub event: TransactionEvent,
}
