//! Tool boundary.
//!
//! Tools are plain handlers keyed by tool id. They only ever see parameters that already
//! passed authorization and validation, and their output is sanitized by the caller.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use atlas_policy::{PermissionResolver, PolicyDecision};
use atlas_store::StoreError;
use atlas_types::ToolDescriptor;

pub mod builtin;
pub use builtin::{builtin_registry, DbCountTool, DbQueryTool, SchemaSearchTool};

/// Failure reported by a tool body. `code` is opaque to the governance layer.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ToolError {
    pub code: String,
    pub message: String,
}

impl ToolError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new("INVALID_PARAMS", message)
    }

    /// Turns a denial from an in-tool check into a tool failure.
    pub fn denied(decision: &PolicyDecision) -> Self {
        match decision {
            PolicyDecision::Deny { reason, message } => Self::new(reason.as_str(), message.clone()),
            PolicyDecision::Allow => Self::new("INTERNAL_ERROR", "allowed decision reported as denial"),
        }
    }
}

impl From<StoreError> for ToolError {
    fn from(err: StoreError) -> Self {
        Self::new("EXECUTION_ERROR", err.to_string())
    }
}

/// What a tool knows about the call it is serving.
#[derive(Clone)]
pub struct ToolContext {
    pub actor_id: String,
    pub session_id: Option<String>,
    pub request_id: String,
    /// For checks finer than the tool level, such as per-collection access.
    pub policy: Arc<PermissionResolver>,
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Declared parameters. Seeded into the descriptor store when the tool is registered.
    fn descriptor(&self) -> ToolDescriptor;

    async fn invoke(&self, ctx: &ToolContext, params: Value) -> Result<Value, ToolError>;
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    handlers: BTreeMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers under the handler's own tool id, replacing any previous handler.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) -> &mut Self {
        let id = handler.descriptor().tool_id;
        self.handlers.insert(id, handler);
        self
    }

    pub fn with(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, tool_id: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(tool_id).cloned()
    }

    pub fn contains(&self, tool_id: &str) -> bool {
        self.handlers.contains_key(tool_id)
    }

    pub fn tool_ids(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.handlers.values().map(|h| h.descriptor()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
