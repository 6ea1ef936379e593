//! YAML configuration for the governance layer.
//!
//! Every section is optional; an empty document yields the built-in defaults.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use atlas_policy::{builtin_requirements, PolicySettings};
use atlas_receipts::{AuditError, AuditStore, JsonlAuditStore, MemoryAuditStore, SqliteAuditStore};
use atlas_redactor::RedactionProfile;
use atlas_schema::DEFAULT_FORBIDDEN_OPERATORS;

pub const CONFIG_ENV: &str = "ATLAS_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid yaml in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("audit backend '{0}' needs a path")]
    MissingAuditPath(&'static str),
    #[error(transparent)]
    Audit(#[from] AuditError),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub cache: CacheConfig,
    pub policy: PolicyConfig,
    pub validator: ValidatorConfig,
    pub sanitizer: RedactionProfile,
    pub audit: AuditConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub actor_capacity: usize,
    pub tool_capacity: usize,
    pub actor_ttl_secs: u64,
    pub tool_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            actor_capacity: 1000,
            tool_capacity: 500,
            actor_ttl_secs: 300,
            tool_ttl_secs: 600,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub default_allow: Vec<String>,
    /// Merged over the built-in map; entries here win.
    pub requirements: BTreeMap<String, String>,
    pub collection_read: String,
    pub collection_write: String,
    pub blocked_collection_prefixes: Vec<String>,
    pub store_timeout_ms: Option<u64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let base = PolicySettings::default();
        Self {
            default_allow: base.default_allow.into_iter().collect(),
            requirements: BTreeMap::new(),
            collection_read: base.collection_read,
            collection_write: base.collection_write,
            blocked_collection_prefixes: base.blocked_collection_prefixes,
            store_timeout_ms: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub forbidden_operators: Vec<String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            forbidden_operators: DEFAULT_FORBIDDEN_OPERATORS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditBackend {
    #[default]
    Memory,
    Jsonl,
    Sqlite,
}

impl AuditBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditBackend::Memory => "memory",
            AuditBackend::Jsonl => "jsonl",
            AuditBackend::Sqlite => "sqlite",
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub backend: AuditBackend,
    pub path: Option<PathBuf>,
    pub write_timeout_ms: Option<u64>,
}

impl AuditConfig {
    pub fn open_store(&self) -> Result<Arc<dyn AuditStore>, ConfigError> {
        let store: Arc<dyn AuditStore> = match self.backend {
            AuditBackend::Memory => Arc::new(MemoryAuditStore::new()),
            AuditBackend::Jsonl => Arc::new(JsonlAuditStore::open(self.required_path()?)?),
            AuditBackend::Sqlite => Arc::new(SqliteAuditStore::open(self.required_path()?)?),
        };
        Ok(store)
    }

    fn required_path(&self) -> Result<&Path, ConfigError> {
        self.path
            .as_deref()
            .ok_or(ConfigError::MissingAuditPath(self.backend.as_str()))
    }
}

impl GovernanceConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    /// Reads the file named by `ATLAS_CONFIG`, or the defaults when it is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_path(path),
            None => Ok(Self::default()),
        }
    }

    pub fn policy_settings(&self) -> PolicySettings {
        let mut requirements = builtin_requirements();
        requirements.extend(self.policy.requirements.clone());
        PolicySettings {
            actor_ttl: Duration::from_secs(self.cache.actor_ttl_secs),
            tool_ttl: Duration::from_secs(self.cache.tool_ttl_secs),
            default_allow: self.policy.default_allow.iter().cloned().collect(),
            static_requirements: requirements,
            collection_read: self.policy.collection_read.clone(),
            collection_write: self.policy.collection_write.clone(),
            blocked_collection_prefixes: self.policy.blocked_collection_prefixes.clone(),
            store_timeout: self.policy.store_timeout_ms.map(Duration::from_millis),
        }
    }
}
