use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use atlas_types::{Actor, ToolDescriptor};

pub mod documents;
pub use documents::InMemoryDocumentExecutor;

pub mod memory;
pub use memory::{InMemoryActorStore, InMemoryToolStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store error: {0}")]
    Backend(String),
}

/// External identity store. `Ok(None)` means the actor does not exist.
#[async_trait]
pub trait ActorStore: Send + Sync {
    async fn find_by_id(&self, actor_id: &str) -> Result<Option<Actor>, StoreError>;
}

/// External tool registry, read-only from the governance layer.
#[async_trait]
pub trait ToolDescriptorStore: Send + Sync {
    async fn find_by_tool_id(&self, tool_id: &str) -> Result<Option<ToolDescriptor>, StoreError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl SortOrder {
    /// Mongo-style direction: negative numbers sort descending.
    pub fn from_direction(direction: &Value) -> Self {
        match direction.as_i64() {
            Some(d) if d < 0 => SortOrder::Descending,
            _ => SortOrder::Ascending,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct FindOptions {
    pub projection: Option<serde_json::Map<String, Value>>,
    pub sort: Vec<(String, SortOrder)>,
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub name: String,
    pub count: u64,
}

/// Generic document/query executor behind the data tools.
/// Only ever invoked after authorization and parameter validation passed.
#[async_trait]
pub trait DocumentExecutor: Send + Sync {
    async fn find(
        &self,
        collection: &str,
        filter: &Value,
        options: &FindOptions,
    ) -> Result<Vec<Value>, StoreError>;

    async fn count(&self, collection: &str, filter: &Value) -> Result<u64, StoreError>;

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>, StoreError>;

    /// One representative document, used for schema introspection.
    async fn sample(&self, collection: &str) -> Result<Option<Value>, StoreError>;
}
