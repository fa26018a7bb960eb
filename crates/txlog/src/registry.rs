use common::NamespaceId;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Result, TxLogError};
use crate::log::{TransactionLog, INDEX_FILE, LOG_FILE};
use crate::options::LogOptions;

/// Owns one [`TransactionLog`] per namespace under a common root directory.
pub struct LogRegistry {
    options: LogOptions,
    logs: RwLock<HashMap<NamespaceId, Arc<TransactionLog>>>,
}

impl LogRegistry {
    /// Open the root and every namespace log already present beneath it.
    pub fn open(options: LogOptions) -> Result<Self> {
        fs::create_dir_all(&options.root)?;

        let mut logs = HashMap::new();
        for entry in fs::read_dir(&options.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(NamespaceId::new) else {
                warn!(path = %entry.path().display(), "skipping non UTF-8 namespace directory");
                continue;
            };
            if !name.is_path_safe() || !looks_like_log_dir(&entry.path()) {
                continue;
            }

            let log = TransactionLog::open(name.clone(), entry.path(), &options)?;
            debug!(namespace = %name, "discovered transaction log");
            logs.insert(name, Arc::new(log));
        }

        info!(
            root = %options.root.display(),
            namespaces = logs.len(),
            "transaction log registry opened"
        );
        Ok(Self {
            options,
            logs: RwLock::new(logs),
        })
    }

    pub fn options(&self) -> &LogOptions {
        &self.options
    }

    /// Existing log for `namespace`, if one has been created.
    pub fn get(&self, namespace: &NamespaceId) -> Result<Option<Arc<TransactionLog>>> {
        let logs = self
            .logs
            .read()
            .map_err(|_| TxLogError::Poisoned("log registry"))?;
        Ok(logs.get(namespace).cloned())
    }

    pub fn get_or_create(&self, namespace: &NamespaceId) -> Result<Arc<TransactionLog>> {
        if !namespace.is_path_safe() {
            return Err(TxLogError::InvalidNamespace(namespace.to_string()));
        }
        if let Some(log) = self.get(namespace)? {
            return Ok(log);
        }

        let mut logs = self
            .logs
            .write()
            .map_err(|_| TxLogError::Poisoned("log registry"))?;
        if let Some(log) = logs.get(namespace) {
            return Ok(log.clone());
        }

        let dir = self.options.root.join(namespace.as_str());
        let log = Arc::new(TransactionLog::open(namespace.clone(), dir, &self.options)?);
        logs.insert(namespace.clone(), log.clone());
        info!(namespace = %namespace, "created transaction log");
        Ok(log)
    }

    pub fn list_namespaces(&self) -> Result<Vec<NamespaceId>> {
        let logs = self
            .logs
            .read()
            .map_err(|_| TxLogError::Poisoned("log registry"))?;
        let mut names: Vec<_> = logs.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

fn looks_like_log_dir(dir: &Path) -> bool {
    dir.join(LOG_FILE).exists() || dir.join(INDEX_FILE).exists()
}
