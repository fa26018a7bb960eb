//! Blob garbage collection over namespace transaction logs and the blob
//! reference index.
//!
//! Log-replayed namespaces are collected by [`LogOrphanCollector`], which
//! derives root sets from the transaction logs, optionally folding in the
//! same namespaces' logs at remote sites. Index-tracked namespaces are
//! collected per storage pool by [`IndexOrphanCollector`]. Expired object
//! records are removed by [`ReferenceCleaner`]. [`CleanupScheduler`] drives
//! all of them periodically on the leader only.

pub mod config;
pub mod error;
pub mod orphan_index;
pub mod orphan_log;
pub mod references;
pub mod remote;
pub mod roots;
pub mod scheduler;
pub mod sweep;

pub use config::{GcConfig, GcConfigBuilder};
pub use error::{GcError, GcResult};
pub use orphan_index::{IndexOrphanCollector, ReferenceCheck};
pub use orphan_log::LogOrphanCollector;
pub use references::{
    CurrentCleanup, LegacyCleanup, NamespaceCleanup, RecordReaper, ReferenceCleaner,
};
pub use remote::{RemoteLogSource, RemoteRoots};
pub use roots::{GcRootState, RootScanner};
pub use scheduler::{
    CleanupScheduler, CleanupService, PeriodicTask, ReferenceCleanupDriver, SchedulerHandle,
    ServiceDriver, SingleFlight, TickOutcome,
};
pub use sweep::{BlobVerdict, CollectionReport};
