//! Per-namespace append-only transaction logs of object add/remove events.
//!
//! Each namespace gets a directory under the registry root holding the log
//! file and a small JSON index that maps replication sites to mask bits and
//! carries the generation id used by readers to notice a dropped log.

pub mod codec;
pub mod error;
pub mod event;
pub mod log;
pub mod options;
pub mod registry;
pub mod site_index;

pub use error::{Result, TxLogError};
pub use event::{LogEntry, SiteMask, TransactionEvent, MAX_SITES};
pub use log::{LogDescription, ReadBatch, TransactionLog};
pub use options::{LogOptions, LogOptionsBuilder, DEFAULT_MAX_SITE_SKIPS};
pub use registry::LogRegistry;
pub use site_index::SiteIndex;
