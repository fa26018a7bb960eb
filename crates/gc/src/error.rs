use common::NamespaceId;
use thiserror::Error;
use txlog::TxLogError;

/// Garbage collection and cleanup failures.
#[derive(Debug, Error)]
pub enum GcError {
    /// Replaying a namespace log failed; reachability cannot be proven.
    #[error("Root scan of {namespace} failed: {source}")]
    RootScan {
        namespace: NamespaceId,
        #[source]
        source: TxLogError,
    },

    /// Blob or reference store call failed.
    #[error("Store operation `{operation}` failed: {source}")]
    Store {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Appending to or opening a namespace log failed.
    #[error("Transaction log operation on {namespace} failed: {source}")]
    Log {
        namespace: NamespaceId,
        #[source]
        source: TxLogError,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type GcResult<T> = std::result::Result<T, GcError>;

impl GcError {
    pub fn store(operation: &'static str, source: anyhow::Error) -> Self {
        GcError::Store { operation, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_scan_message_names_namespace() {
        let err = GcError::RootScan {
            namespace: NamespaceId::new("assets"),
            source: TxLogError::Poisoned("writer"),
        };
        assert_eq!(
            err.to_string(),
            "Root scan of assets failed: Lock poisoned: writer"
        );
    }

    #[test]
    fn store_helper() {
        let err = GcError::store("delete_object", anyhow::anyhow!("timeout"));
        assert_eq!(err.to_string(), "Store operation `delete_object` failed: timeout");
    }
}
