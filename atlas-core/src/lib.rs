//! Governance kernel: wires the authorization, validation, sanitization and audit planes
//! around every tool invocation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use atlas_receipts::AuditStore;
use atlas_store::{ActorStore, ToolDescriptorStore};
use atlas_tools::{ToolError, ToolRegistry};
use atlas_types::ReasonCode;

pub mod config;
pub use config::{AuditBackend, ConfigError, GovernanceConfig, CONFIG_ENV};

pub mod fixtures;
pub use fixtures::Fixtures;

mod kernel;
pub use kernel::GovernanceKernel;

/// Reason code carried by a `Failed` result when no handler is registered for the tool.
pub const TOOL_NOT_FOUND: &str = "TOOL_NOT_FOUND";

/// One tool-call attempt as handed over by the agent loop.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ToolRequest {
    pub actor_id: String,
    pub tool_id: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Correlation id; minted when absent.
    #[serde(default)]
    pub request_id: Option<String>,
}

impl ToolRequest {
    pub fn new(actor_id: impl Into<String>, tool_id: impl Into<String>, params: Value) -> Self {
        Self {
            actor_id: actor_id.into(),
            tool_id: tool_id.into(),
            params,
            session_id: None,
            request_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    /// Stopped by authorization or validation; the tool never ran.
    Denied {
        reason_code: ReasonCode,
        message: String,
    },
    /// Tool output, already sanitized.
    Completed { data: Value },
    /// Tool-body error, passed through unchanged.
    Failed { error: ToolError },
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Completed { .. })
    }

    /// Code stored as the audit reason.
    pub fn reason(&self) -> Option<&str> {
        match self {
            ExecutionResult::Denied { reason_code, .. } => Some(reason_code.as_str()),
            ExecutionResult::Completed { .. } => None,
            ExecutionResult::Failed { error } => Some(error.code.as_str()),
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            ExecutionResult::Denied { message, .. } => Some(message),
            ExecutionResult::Completed { .. } => None,
            ExecutionResult::Failed { error } => Some(&error.message),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub request_id: String,
    /// `false` when the audit record could not be stored. The result stands either way.
    pub audited: bool,
    pub duration_ms: u64,
    pub result: ExecutionResult,
}

/// External collaborators the kernel is built around.
pub struct Collaborators {
    pub actors: Arc<dyn ActorStore>,
    pub tools: Arc<dyn ToolDescriptorStore>,
    pub registry: ToolRegistry,
    pub audit: Arc<dyn AuditStore>,
}
