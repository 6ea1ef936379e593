use std::collections::BTreeSet;
use std::fmt;

/// Tokens that grant every tool unconditionally.
pub const SUPER_TOKENS: [&str; 3] = ["all", "*", "ai:*"];

/// A parsed permission string.
///
/// `ai:db.query` is exact, `ai:db.*` is a wildcard over everything below `ai:db`,
/// and the members of [`SUPER_TOKENS`] short-circuit all checks.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Permission {
    Super(String),
    Wildcard { prefix: String },
    Exact(String),
}

impl Permission {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if SUPER_TOKENS.contains(&raw) {
            return Permission::Super(raw.to_string());
        }
        match raw.strip_suffix(".*") {
            Some(prefix) if !prefix.is_empty() => Permission::Wildcard {
                prefix: prefix.to_string(),
            },
            _ => Permission::Exact(raw.to_string()),
        }
    }

    pub fn is_super(&self) -> bool {
        matches!(self, Permission::Super(_))
    }

    /// Whether holding `self` satisfies `required`.
    pub fn covers(&self, required: &str) -> bool {
        match self {
            Permission::Super(_) => true,
            Permission::Exact(p) => p == required,
            // `reports.*` also covers the bare `reports` segment
            Permission::Wildcard { prefix } => required
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.is_empty() || (rest.starts_with('.') && rest.len() > 1)),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Super(token) => f.write_str(token),
            Permission::Wildcard { prefix } => write!(f, "{prefix}.*"),
            Permission::Exact(p) => f.write_str(p),
        }
    }
}

/// Resolved permissions held by one actor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PermissionSet {
    grants: BTreeSet<Permission>,
}

impl PermissionSet {
    pub fn from_strings<I, S>(raw: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::default();
        set.extend(raw);
        set
    }

    pub fn extend<I, S>(&mut self, raw: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for p in raw {
            let p = p.as_ref();
            if !p.trim().is_empty() {
                self.grants.insert(Permission::parse(p));
            }
        }
    }

    pub fn has_super(&self) -> bool {
        self.grants.iter().any(Permission::is_super)
    }

    pub fn contains_exact(&self, required: &str) -> bool {
        self.grants
            .iter()
            .any(|p| matches!(p, Permission::Exact(e) if e == required))
    }

    pub fn covers_by_wildcard(&self, required: &str) -> bool {
        self.grants
            .iter()
            .any(|p| matches!(p, Permission::Wildcard { .. }) && p.covers(required))
    }

    pub fn grants(&self, required: &str) -> bool {
        self.grants.iter().any(|p| p.covers(required))
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Permission> {
        self.grants.iter()
    }
}
