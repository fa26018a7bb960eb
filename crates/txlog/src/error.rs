use common::NamespaceId;
use thiserror::Error;

/// Transaction log failures.
#[derive(Debug, Error)]
pub enum TxLogError {
    /// Record payload does not hash to the checksum stored in its header.
    /// The log is unreadable past `offset` until repaired.
    #[error("Checksum mismatch at offset {offset}: header {expected}, payload {actual}")]
    ChecksumMismatch {
        offset: u64,
        expected: String,
        actual: String,
    },

    /// Index file was written by an incompatible format version.
    #[error("Unsupported log index version {found} (expected {expected})")]
    VersionMismatch { expected: u32, found: u32 },

    /// Nothing has ever been appended to this namespace.
    #[error("Transaction log for {namespace} is empty")]
    EmptyLog { namespace: NamespaceId },

    /// Every bit of the 64-bit site mask is taken.
    #[error("Cannot register site {site}: all {limit} site slots are allocated")]
    SiteLimitExceeded { site: String, limit: usize },

    #[error("Invalid namespace name {0:?}")]
    InvalidNamespace(String),

    #[error("Cannot encode event: {0}")]
    Encode(String),

    /// Checksum matched but the payload is not a valid event.
    #[error("Malformed record at offset {offset}: {reason}")]
    Decode { offset: u64, reason: String },

    #[error("Lock poisoned: {0}")]
    Poisoned(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TxLogError>;

impl TxLogError {
    pub fn is_empty_log(&self) -> bool {
        matches!(self, TxLogError::EmptyLog { .. })
    }
}
