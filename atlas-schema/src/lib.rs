//! Parameter validation against a tool's declared schema.
//!
//! Strict on three things only: required fields, enum membership and forbidden query
//! operators anywhere in the tree. Everything else (unknown fields, loose types) passes through.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use atlas_store::ToolDescriptorStore;
use atlas_types::{ReasonCode, ToolDescriptor};

/// Operators that turn a filter into code execution or a write/join stage.
pub const DEFAULT_FORBIDDEN_OPERATORS: [&str; 8] = [
    "$where",
    "$function",
    "$accumulator",
    "$expr",
    "$out",
    "$merge",
    "$lookup",
    "$unionWith",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required parameter '{field}'")]
    MissingRequired { field: String },
    #[error("parameter '{field}' must be one of {allowed}, got {actual}")]
    InvalidEnum {
        field: String,
        allowed: String,
        actual: String,
    },
    #[error("forbidden operator '{key}' at '{path}'")]
    DangerousOperator { key: String, path: String },
    #[error("parameters must be an object, got {kind}")]
    InvalidParams { kind: &'static str },
    #[error("tool descriptor lookup failed: {0}")]
    Lookup(String),
}

impl ValidationError {
    pub fn code(&self) -> ReasonCode {
        match self {
            ValidationError::MissingRequired { .. } => ReasonCode::MissingRequiredParam,
            ValidationError::InvalidEnum { .. } => ReasonCode::InvalidEnumValue,
            ValidationError::DangerousOperator { .. } => ReasonCode::DangerousOperator,
            ValidationError::InvalidParams { .. } => ReasonCode::InvalidParams,
            ValidationError::Lookup(_) => ReasonCode::InternalCheckError,
        }
    }
}

/// Parameters that passed validation, with declared defaults filled in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatedParams {
    pub tool_id: String,
    pub params: Map<String, Value>,
    pub defaults_applied: Vec<String>,
    pub credential_bearing: bool,
}

impl ValidatedParams {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.params.get(field)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.params)
    }
}

pub struct ParameterValidator {
    tools: Arc<dyn ToolDescriptorStore>,
    forbidden: BTreeSet<String>,
}

impl ParameterValidator {
    pub fn new(tools: Arc<dyn ToolDescriptorStore>) -> Self {
        Self {
            tools,
            forbidden: normalize_operators(DEFAULT_FORBIDDEN_OPERATORS),
        }
    }

    pub fn with_forbidden_operators<I, S>(mut self, operators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.forbidden = normalize_operators(operators);
        self
    }

    /// Looks up the tool's descriptor and validates `raw` against it.
    pub async fn validate(&self, tool_id: &str, raw: Value) -> Result<ValidatedParams, ValidationError> {
        let descriptor = self
            .tools
            .find_by_tool_id(tool_id)
            .await
            .map_err(|e| ValidationError::Lookup(e.to_string()))?;
        self.validate_against(tool_id, descriptor.as_ref(), raw)
    }

    /// Validation with an already loaded descriptor. Tools without a descriptor get the
    /// shape check and the operator scan only.
    pub fn validate_against(
        &self,
        tool_id: &str,
        descriptor: Option<&ToolDescriptor>,
        raw: Value,
    ) -> Result<ValidatedParams, ValidationError> {
        let mut params = match raw {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(ValidationError::InvalidParams {
                    kind: kind_of(&other),
                })
            }
        };

        if let Some((key, path)) = scan_object(&params, &self.forbidden, "") {
            warn!(tool_id, key = %key, path = %path, "forbidden operator in parameters");
            return Err(ValidationError::DangerousOperator { key, path });
        }

        let Some(descriptor) = descriptor else {
            return Ok(ValidatedParams {
                tool_id: tool_id.to_string(),
                params,
                defaults_applied: Vec::new(),
                credential_bearing: false,
            });
        };
        let schema = &descriptor.parameters;

        let mut defaults_applied = Vec::new();
        for (name, spec) in &schema.properties {
            let Some(default) = &spec.default else { continue };
            if params.get(name).map_or(true, Value::is_null) {
                params.insert(name.clone(), default.clone());
                defaults_applied.push(name.clone());
            }
        }

        for field in &schema.required {
            if params.get(field).map_or(true, Value::is_null) {
                return Err(ValidationError::MissingRequired {
                    field: field.clone(),
                });
            }
        }

        for (name, spec) in &schema.properties {
            let (Some(allowed), Some(actual)) = (&spec.allowed, params.get(name)) else {
                continue;
            };
            if actual.is_null() || allowed.contains(actual) {
                continue;
            }
            return Err(ValidationError::InvalidEnum {
                field: name.clone(),
                allowed: Value::Array(allowed.clone()).to_string(),
                actual: actual.to_string(),
            });
        }

        Ok(ValidatedParams {
            tool_id: tool_id.to_string(),
            params,
            defaults_applied,
            credential_bearing: descriptor.credential_bearing,
        })
    }
}

fn normalize_operators<I, S>(operators: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    operators
        .into_iter()
        .map(|op| op.as_ref().to_ascii_lowercase())
        .collect()
}

/// Depth-first scan for a forbidden key. Returns the key and its path
/// (`query.$or[1].$where`).
pub fn find_forbidden(value: &Value, forbidden: &BTreeSet<String>) -> Option<(String, String)> {
    scan(value, forbidden, "")
}

fn scan(value: &Value, forbidden: &BTreeSet<String>, path: &str) -> Option<(String, String)> {
    match value {
        Value::Object(map) => scan_object(map, forbidden, path),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .find_map(|(i, child)| scan(child, forbidden, &format!("{path}[{i}]"))),
        _ => None,
    }
}

fn scan_object(
    map: &Map<String, Value>,
    forbidden: &BTreeSet<String>,
    path: &str,
) -> Option<(String, String)> {
    map.iter().find_map(|(key, child)| {
        let here = if path.is_empty() {
            key.clone()
        } else {
            format!("{path}.{key}")
        };
        if forbidden.contains(&key.to_ascii_lowercase()) {
            return Some((key.clone(), here));
        }
        scan(child, forbidden, &here)
    })
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
