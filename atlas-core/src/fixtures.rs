use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use atlas_store::{InMemoryActorStore, InMemoryDocumentExecutor, InMemoryToolStore};
use atlas_tools::builtin_registry;
use atlas_types::{Actor, ToolDescriptor};

use crate::config::{ConfigError, GovernanceConfig};
use crate::Collaborators;

/// Seed data for the in-memory stores: actors, tool descriptors and document collections.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Fixtures {
    pub actors: Vec<Actor>,
    pub tools: Vec<ToolDescriptor>,
    pub collections: BTreeMap<String, Vec<Value>>,
}

impl Fixtures {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// In-memory collaborators with the built-in data tools registered.
    ///
    /// Built-in descriptors are seeded first, so a fixture descriptor with the same id
    /// replaces it.
    pub fn into_collaborators(self, config: &GovernanceConfig) -> Result<Collaborators, ConfigError> {
        let documents = self
            .collections
            .into_iter()
            .fold(InMemoryDocumentExecutor::new(), |exec, (name, docs)| {
                exec.with_collection(name, docs)
            });
        let registry = builtin_registry(Arc::new(documents));
        let descriptors = registry.descriptors().into_iter().chain(self.tools);
        Ok(Collaborators {
            actors: Arc::new(InMemoryActorStore::new(self.actors)),
            tools: Arc::new(InMemoryToolStore::new(descriptors)),
            registry,
            audit: config.audit.open_store()?,
        })
    }
}
