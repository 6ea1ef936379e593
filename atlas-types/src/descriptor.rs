use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declared permission requirement of a tool.
///
/// Absent in the descriptor document means `NotConfigured` (infer it), an explicit
/// `null` means `Open` (no permission needed). The two must never be collapsed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum RequiredPermission {
    #[default]
    NotConfigured,
    Open,
    Required(String),
}

impl RequiredPermission {
    pub fn is_not_configured(&self) -> bool {
        matches!(self, RequiredPermission::NotConfigured)
    }
}

mod required_permission_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::RequiredPermission;

    pub fn serialize<S: Serializer>(value: &RequiredPermission, s: S) -> Result<S::Ok, S::Error> {
        match value {
            RequiredPermission::Required(p) => s.serialize_some(p),
            _ => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<RequiredPermission, D::Error> {
        Ok(match Option::<String>::deserialize(d)? {
            Some(p) => RequiredPermission::Required(p),
            None => RequiredPermission::Open,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

/// One declared parameter. `type` is informational; the validator is strict only on
/// required-ness, enum membership and forbidden operators.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ParamType>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamSchema {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, ParamSpec>,
}

impl ParamSchema {
    pub fn required(mut self, field: impl Into<String>) -> Self {
        self.required.push(field.into());
        self
    }

    pub fn property(mut self, name: impl Into<String>, param: ParamSpec) -> Self {
        self.properties.insert(name.into(), param);
        self
    }
}

/// Describes one invocable tool. Owned by the external tool registry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub tool_id: String,
    #[serde(
        default,
        with = "required_permission_serde",
        skip_serializing_if = "RequiredPermission::is_not_configured"
    )]
    pub required_permission: RequiredPermission,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Parameters of credential-bearing tools are never persisted in plaintext.
    #[serde(default)]
    pub credential_bearing: bool,
    #[serde(default)]
    pub parameters: ParamSchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ToolDescriptor {
    pub fn new(tool_id: impl Into<String>) -> Self {
        Self {
            tool_id: tool_id.into(),
            required_permission: RequiredPermission::NotConfigured,
            category: None,
            credential_bearing: false,
            parameters: ParamSchema::default(),
            description: None,
        }
    }

    pub fn requires(mut self, permission: impl Into<String>) -> Self {
        self.required_permission = RequiredPermission::Required(permission.into());
        self
    }

    pub fn open(mut self) -> Self {
        self.required_permission = RequiredPermission::Open;
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn parameters(mut self, schema: ParamSchema) -> Self {
        self.parameters = schema;
        self
    }

    pub fn credential_bearing(mut self) -> Self {
        self.credential_bearing = true;
        self
    }

    /// Last dot segment of the tool id (`crm.get_client` -> `get_client`).
    pub fn suffix(&self) -> &str {
        tool_suffix(&self.tool_id)
    }
}

pub fn tool_suffix(tool_id: &str) -> &str {
    tool_id.rsplit('.').next().unwrap_or(tool_id)
}
