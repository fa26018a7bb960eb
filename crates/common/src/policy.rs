use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::traits::NamespacePolicyResolver;
use crate::NamespaceId;

/// Which cleanup machinery owns a namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStrategy {
    /// Root sets come from replaying the transaction log.
    Legacy,
    /// Root sets come from the maintained blob reference index.
    #[default]
    Current,
}

/// Per-namespace cleanup policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespacePolicy {
    #[serde(default)]
    pub strategy: CleanupStrategy,

    /// Namespaces naming the same pool share physical blob storage.
    /// Unset means the namespace is its own pool.
    #[serde(default)]
    pub storage_pool: Option<String>,

    /// Overrides the configured last-access cutoff for reference cleanup.
    #[serde(default)]
    pub last_access_cutoff_secs: Option<u64>,
}

impl NamespacePolicy {
    /// Policy for a namespace still cleaned by log replay
    pub fn legacy() -> Self {
        Self {
            strategy: CleanupStrategy::Legacy,
            ..Self::default()
        }
    }

    /// Policy for a namespace on the reference-index model, sharing `pool`
    pub fn current_in_pool(pool: impl Into<String>) -> Self {
        Self {
            strategy: CleanupStrategy::Current,
            storage_pool: Some(pool.into()),
            last_access_cutoff_secs: None,
        }
    }

    pub fn with_last_access_cutoff(mut self, cutoff: Duration) -> Self {
        self.last_access_cutoff_secs = Some(cutoff.as_secs());
        self
    }

    pub fn pool_for(&self, namespace: &NamespaceId) -> String {
        self.storage_pool
            .clone()
            .unwrap_or_else(|| namespace.as_str().to_string())
    }

    pub fn last_access_cutoff(&self) -> Option<Duration> {
        self.last_access_cutoff_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    /// The namespace has no configured policy and must not be cleaned.
    #[error("Unknown namespace: {0}")]
    UnknownNamespace(NamespaceId),

    #[error("Failed to load namespace policies from {path}: {reason}")]
    Load { path: String, reason: String },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    namespaces: BTreeMap<NamespaceId, NamespacePolicy>,
}

/// Resolver backed by a fixed table, usually loaded from YAML.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicyResolver {
    policies: BTreeMap<NamespaceId, NamespacePolicy>,
}

impl StaticPolicyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, namespace: impl Into<NamespaceId>, policy: NamespacePolicy) -> Self {
        self.policies.insert(namespace.into(), policy);
        self
    }

    pub fn insert(&mut self, namespace: NamespaceId, policy: NamespacePolicy) {
        self.policies.insert(namespace, policy);
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, PolicyError> {
        let file: PolicyFile = serde_yaml::from_str(raw).map_err(|err| PolicyError::Load {
            path: "<inline>".to_string(),
            reason: err.to_string(),
        })?;
        Ok(Self {
            policies: file.namespaces,
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| PolicyError::Load {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        Self::from_yaml_str(&raw).map_err(|err| match err {
            PolicyError::Load { reason, .. } => PolicyError::Load {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    pub fn namespaces(&self) -> Vec<NamespaceId> {
        self.policies.keys().cloned().collect()
    }
}

impl NamespacePolicyResolver for StaticPolicyResolver {
    fn policy(&self, namespace: &NamespaceId) -> Result<NamespacePolicy, PolicyError> {
        self.policies
            .get(namespace)
            .cloned()
            .ok_or_else(|| PolicyError::UnknownNamespace(namespace.clone()))
    }

    fn configured_namespaces(&self) -> Vec<NamespaceId> {
        self.namespaces()
    }
}
