use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const REDACTED: &str = "[REDACTED]";

/// Credential-like field names, compared after [`normalize`].
pub const DEFAULT_DENIED_FIELDS: [&str; 11] = [
    "password",
    "passwordhash",
    "secret",
    "clientsecret",
    "apikey",
    "accesstoken",
    "refreshtoken",
    "privatekey",
    "token",
    "salt",
    "credentials",
];

pub const DEFAULT_INTERNAL_PREFIXES: [&str; 2] = ["__", "_internal"];

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RedactionProfile {
    #[serde(default = "default_denied_fields")]
    pub denied_fields: Vec<String>,
    #[serde(default = "default_internal_prefixes")]
    pub internal_prefixes: Vec<String>,
}

impl Default for RedactionProfile {
    fn default() -> Self {
        Self {
            denied_fields: default_denied_fields(),
            internal_prefixes: default_internal_prefixes(),
        }
    }
}

fn default_denied_fields() -> Vec<String> {
    DEFAULT_DENIED_FIELDS.iter().map(|s| s.to_string()).collect()
}

fn default_internal_prefixes() -> Vec<String> {
    DEFAULT_INTERNAL_PREFIXES.iter().map(|s| s.to_string()).collect()
}

/// Strips privileged fields from anything leaving the governance boundary.
///
/// Pure and unconditional: who is asking never matters.
#[derive(Clone, Debug)]
pub struct Sanitizer {
    denied: BTreeSet<String>,
    internal_prefixes: Vec<String>,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(&RedactionProfile::default())
    }
}

impl Sanitizer {
    pub fn new(profile: &RedactionProfile) -> Self {
        Self {
            denied: profile.denied_fields.iter().map(|f| normalize(f)).collect(),
            internal_prefixes: profile
                .internal_prefixes
                .iter()
                .filter(|p| !p.is_empty())
                .cloned()
                .collect(),
        }
    }

    /// Whether a field with this name must never leave the boundary.
    pub fn is_sensitive(&self, key: &str) -> bool {
        self.denied.contains(&normalize(key))
            || self.internal_prefixes.iter().any(|p| key.starts_with(p.as_str()))
    }

    /// Removes sensitive fields at every depth, including inside arrays.
    pub fn sanitize(&self, value: Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .filter(|(k, _)| !self.is_sensitive(k))
                    .map(|(k, v)| (k, self.sanitize(v)))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.into_iter().map(|v| self.sanitize(v)).collect()),
            other => other,
        }
    }

    /// Like [`Sanitizer::sanitize`] but keeps the keys and replaces their values,
    /// so an audit trail still shows which fields were supplied.
    pub fn mask(&self, value: Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    let v = if self.is_sensitive(&k) {
                        Value::String(REDACTED.into())
                    } else {
                        self.mask(v)
                    };
                    out.insert(k, v);
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.into_iter().map(|v| self.mask(v)).collect()),
            other => other,
        }
    }
}

/// `API_KEY`, `api-key` and `apiKey` all normalize to `apikey`.
fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Sanitizes with the default profile.
pub fn sanitize(value: Value) -> Value {
    Sanitizer::default().sanitize(value)
}
