//! Shared vocabulary for the governance planes: actors, roles, permissions,
//! tool descriptors and the stable reason codes every denial carries.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod descriptor;
pub mod permission;

pub use descriptor::{ParamSchema, ParamSpec, ParamType, RequiredPermission, ToolDescriptor};
pub use permission::{Permission, PermissionSet, SUPER_TOKENS};

/// Identity attempting a tool invocation. Owned by an external identity store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    /// Directly granted permission strings.
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            permissions: Vec::new(),
            role,
        }
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    /// Direct grants unioned with the role defaults.
    pub fn effective_permissions(&self) -> PermissionSet {
        let mut set = PermissionSet::from_strings(&self.permissions);
        set.extend(self.role.default_permissions().iter().copied());
        set
    }
}

/// Closed role enumeration. Unknown labels coming from the identity store land on `Guest`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    Staff,
    Viewer,
    #[default]
    #[serde(other)]
    Guest,
}

impl Role {
    pub fn default_permissions(self) -> &'static [&'static str] {
        match self {
            Role::Admin => &["all"],
            Role::Manager => &["ai:db.*", "ai:schema.*", "ai:crm.*", "ai:finance.*"],
            Role::Staff => &["ai:db.query", "ai:schema.read", "ai:crm.read"],
            Role::Viewer => &["ai:schema.read"],
            Role::Guest => &[],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Staff => "staff",
            Role::Viewer => "viewer",
            Role::Guest => "guest",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable reason codes attached to every denial or rejected attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    ActorNotFound,
    PermissionDenied,
    InternalCheckError,
    MissingRequiredParam,
    InvalidEnumValue,
    DangerousOperator,
    InvalidParams,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::ActorNotFound => "ACTOR_NOT_FOUND",
            ReasonCode::PermissionDenied => "PERMISSION_DENIED",
            ReasonCode::InternalCheckError => "INTERNAL_CHECK_ERROR",
            ReasonCode::MissingRequiredParam => "MISSING_REQUIRED_PARAM",
            ReasonCode::InvalidEnumValue => "INVALID_ENUM_VALUE",
            ReasonCode::DangerousOperator => "DANGEROUS_OPERATOR",
            ReasonCode::InvalidParams => "INVALID_PARAMS",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_role_label_is_guest() {
        let role: Role = serde_json::from_str("\"contractor\"").unwrap();
        assert_eq!(role, Role::Guest);
        let role: Role = serde_json::from_str("\"manager\"").unwrap();
        assert_eq!(role, Role::Manager);
    }

    #[test]
    fn effective_permissions_union_role_defaults() {
        let actor = Actor::new("u1", Role::Viewer).with_permissions(["ai:crm.read"]);
        let set = actor.effective_permissions();
        assert!(set.contains_exact("ai:crm.read"));
        assert!(set.contains_exact("ai:schema.read"));
        assert!(!set.has_super());
    }

    #[test]
    fn reason_codes_serialize_screaming() {
        let json = serde_json::to_string(&ReasonCode::DangerousOperator).unwrap();
        assert_eq!(json, "\"DANGEROUS_OPERATOR\"");
        assert_eq!(ReasonCode::ActorNotFound.to_string(), "ACTOR_NOT_FOUND");
    }
}
