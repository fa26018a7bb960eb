//! HTTP access to namespace transaction logs.
//!
//! [`server::LogServer`] exposes a [`LogView`] over axum so remote sites can
//! pull events they have not yet seen; [`client::RemoteLogClient`] is the
//! matching reqwest consumer.

use common::NamespaceId;
use std::sync::Arc;
use tokio::task;
use txlog::{LogRegistry, ReadBatch, TxLogError};

pub mod client;
pub mod error;
pub mod handlers;
pub mod server;

pub use client::RemoteLogClient;
pub use error::ProtocolError;
pub use server::LogServer;

/// Upper bound on events returned by one remote read.
pub const MAX_READ_COUNT: usize = 10_000;

/// Read-only view of a [`LogRegistry`] for request handlers.
///
/// Log reads are blocking file I/O and run on the blocking pool.
#[derive(Clone)]
pub struct LogView {
    registry: Arc<LogRegistry>,
}

impl LogView {
    pub fn new(registry: Arc<LogRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<LogRegistry> {
        &self.registry
    }

    pub fn namespaces(&self) -> Result<Vec<NamespaceId>, ProtocolError> {
        Ok(self.registry.list_namespaces()?)
    }

    /// Same cursor semantics as a local read. A namespace that has never
    /// been written reads as an empty log.
    pub async fn read(
        &self,
        namespace: NamespaceId,
        offset: u64,
        count: usize,
        not_seen_at: Option<String>,
    ) -> Result<ReadBatch, ProtocolError> {
        if !namespace.is_path_safe() {
            return Err(TxLogError::InvalidNamespace(namespace.to_string()).into());
        }
        let Some(log) = self.registry.get(&namespace)? else {
            return Err(TxLogError::EmptyLog { namespace }.into());
        };

        let count = count.clamp(1, MAX_READ_COUNT);
        let batch = task::spawn_blocking(move || log.read(offset, count, not_seen_at.as_deref()))
            .await??;
        Ok(batch)
    }
}
