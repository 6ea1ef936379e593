//! Authorization plane: decides whether an actor may invoke a tool or touch a collection.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use atlas_store::StoreError;
use atlas_types::ReasonCode;

pub mod requirement;
pub use requirement::{
    builtin_requirements, default_chain, CategorySource, DescriptorSource, Requirement,
    RequirementSource, StaticMapSource,
};

mod resolver;
pub use resolver::{PermissionResolver, ResolverCaches};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PolicyDecision {
    Allow,
    Deny { reason: ReasonCode, message: String },
}

impl PolicyDecision {
    pub fn deny(reason: ReasonCode, message: impl Into<String>) -> Self {
        PolicyDecision::Deny {
            reason,
            message: message.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }

    pub fn reason(&self) -> Option<ReasonCode> {
        match self {
            PolicyDecision::Allow => None,
            PolicyDecision::Deny { reason, .. } => Some(*reason),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionOp {
    Read,
    Write,
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Tunables of the resolver. TTLs are owned here, not by the caches.
#[derive(Clone, Debug)]
pub struct PolicySettings {
    pub actor_ttl: Duration,
    pub tool_ttl: Duration,
    /// Baseline tools every existing actor may call.
    pub default_allow: BTreeSet<String>,
    pub static_requirements: BTreeMap<String, String>,
    pub collection_read: String,
    pub collection_write: String,
    pub blocked_collection_prefixes: Vec<String>,
    pub store_timeout: Option<Duration>,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            actor_ttl: Duration::from_secs(300),
            tool_ttl: Duration::from_secs(600),
            default_allow: ["db.query", "schema.search"]
                .into_iter()
                .map(String::from)
                .collect(),
            static_requirements: builtin_requirements(),
            collection_read: "ai:db.query".into(),
            collection_write: "ai:db.mutate".into(),
            blocked_collection_prefixes: vec!["system.".into()],
            store_timeout: None,
        }
    }
}
