//! Ordered chain that turns a tool id into its permission requirement.

use std::collections::BTreeMap;

use atlas_types::{RequiredPermission, ToolDescriptor};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Requirement {
    /// No permission needed.
    Open,
    Permission(String),
}

impl Requirement {
    pub fn into_permission(self) -> Option<String> {
        match self {
            Requirement::Open => None,
            Requirement::Permission(p) => Some(p),
        }
    }
}

/// One link of the resolution chain. `None` hands over to the next source.
pub trait RequirementSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn resolve(&self, tool_id: &str, descriptor: Option<&ToolDescriptor>) -> Option<Requirement>;
}

/// Honors an explicit setting on the descriptor, including an explicit "open".
pub struct DescriptorSource;

impl RequirementSource for DescriptorSource {
    fn name(&self) -> &'static str {
        "descriptor"
    }

    fn resolve(&self, _tool_id: &str, descriptor: Option<&ToolDescriptor>) -> Option<Requirement> {
        match &descriptor?.required_permission {
            RequiredPermission::NotConfigured => None,
            RequiredPermission::Open => Some(Requirement::Open),
            RequiredPermission::Required(p) => Some(Requirement::Permission(p.clone())),
        }
    }
}

/// Unconfigured descriptors with a category get `ai:{category}.{suffix}`.
pub struct CategorySource;

impl RequirementSource for CategorySource {
    fn name(&self) -> &'static str {
        "category"
    }

    fn resolve(&self, _tool_id: &str, descriptor: Option<&ToolDescriptor>) -> Option<Requirement> {
        let descriptor = descriptor?;
        let category = descriptor.category.as_deref().filter(|c| !c.is_empty())?;
        Some(Requirement::Permission(format!(
            "ai:{category}.{}",
            descriptor.suffix()
        )))
    }
}

pub struct StaticMapSource {
    map: BTreeMap<String, String>,
}

impl StaticMapSource {
    pub fn new(map: BTreeMap<String, String>) -> Self {
        Self { map }
    }
}

impl RequirementSource for StaticMapSource {
    fn name(&self) -> &'static str {
        "static"
    }

    fn resolve(&self, tool_id: &str, _descriptor: Option<&ToolDescriptor>) -> Option<Requirement> {
        self.map
            .get(tool_id)
            .map(|p| Requirement::Permission(p.clone()))
    }
}

pub fn default_chain(static_map: BTreeMap<String, String>) -> Vec<Box<dyn RequirementSource>> {
    vec![
        Box::new(DescriptorSource),
        Box::new(CategorySource),
        Box::new(StaticMapSource::new(static_map)),
    ]
}

/// Well-known tools and the permission each one needs.
pub fn builtin_requirements() -> BTreeMap<String, String> {
    [
        ("db.query", "ai:db.query"),
        ("db.count", "ai:db.query"),
        ("db.aggregate", "ai:db.aggregate"),
        ("db.insert", "ai:db.mutate"),
        ("db.update", "ai:db.mutate"),
        ("db.delete", "ai:db.mutate"),
        ("schema.search", "ai:schema.read"),
        ("schema.list", "ai:schema.read"),
        ("crm.get_client_detail", "ai:crm.read"),
        ("crm.search_clients", "ai:crm.read"),
        ("crm.get_client_categories", "ai:crm.read"),
        ("finance.get_quotation_detail", "ai:finance.read"),
        ("finance.query_client_quotation", "ai:finance.read"),
        ("finance.get_service_pricing", "ai:finance.read"),
    ]
    .into_iter()
    .map(|(t, p)| (t.to_string(), p.to_string()))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_match(tool_id: &str, descriptor: Option<&ToolDescriptor>) -> Option<Requirement> {
        default_chain(builtin_requirements())
            .iter()
            .find_map(|s| s.resolve(tool_id, descriptor))
    }

    #[test]
    fn explicit_open_beats_category() {
        let d = ToolDescriptor::new("crm.ping").category("crm").open();
        assert_eq!(first_match("crm.ping", Some(&d)), Some(Requirement::Open));
    }

    #[test]
    fn category_synthesizes_from_suffix() {
        let d = ToolDescriptor::new("crm.export_clients").category("crm");
        assert_eq!(
            first_match("crm.export_clients", Some(&d)),
            Some(Requirement::Permission("ai:crm.export_clients".into()))
        );
    }

    #[test]
    fn static_map_then_nothing() {
        assert_eq!(
            first_match("db.count", None),
            Some(Requirement::Permission("ai:db.query".into()))
        );
        // an unconfigured descriptor without category falls through to the map
        let d = ToolDescriptor::new("finance.get_service_pricing");
        assert_eq!(
            first_match("finance.get_service_pricing", Some(&d)),
            Some(Requirement::Permission("ai:finance.read".into()))
        );
        assert_eq!(first_match("unknown.tool", None), None);
    }
}
