//! Data tools over a [`DocumentExecutor`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use atlas_policy::CollectionOp;
use atlas_store::{DocumentExecutor, FindOptions, SortOrder};
use atlas_types::{ParamSchema, ParamSpec, ParamType, ToolDescriptor};

use crate::{ToolContext, ToolError, ToolHandler, ToolRegistry};

pub const DEFAULT_QUERY_LIMIT: u64 = 10;
pub const MAX_QUERY_LIMIT: u64 = 100;

/// Registry with every data tool bound to one executor.
pub fn builtin_registry(executor: Arc<dyn DocumentExecutor>) -> ToolRegistry {
    ToolRegistry::new()
        .with(Arc::new(DbQueryTool::new(executor.clone())))
        .with(Arc::new(DbCountTool::new(executor.clone())))
        .with(Arc::new(SchemaSearchTool::new(executor)))
}

fn param(kind: ParamType, description: &str) -> ParamSpec {
    ParamSpec {
        kind: Some(kind),
        description: Some(description.to_string()),
        ..ParamSpec::default()
    }
}

fn described(descriptor: ToolDescriptor, text: &str) -> ToolDescriptor {
    ToolDescriptor {
        description: Some(text.to_string()),
        ..descriptor
    }
}

fn collection_param(params: &Value) -> Result<&str, ToolError> {
    params
        .get("collection")
        .and_then(Value::as_str)
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ToolError::invalid("'collection' must be a non-empty string"))
}

/// Absent or null filters match everything; anything else must be an object.
fn filter_param(params: &Value) -> Result<Value, ToolError> {
    match params.get("query") {
        None | Some(Value::Null) => Ok(json!({})),
        Some(q @ Value::Object(_)) => Ok(q.clone()),
        Some(_) => Err(ToolError::invalid("'query' must be an object")),
    }
}

async fn ensure_readable(ctx: &ToolContext, collection: &str) -> Result<(), ToolError> {
    let decision = ctx
        .policy
        .check_collection_permission(&ctx.actor_id, collection, CollectionOp::Read)
        .await;
    if decision.is_allowed() {
        Ok(())
    } else {
        Err(ToolError::denied(&decision))
    }
}

pub struct DbQueryTool {
    executor: Arc<dyn DocumentExecutor>,
}

impl DbQueryTool {
    pub fn new(executor: Arc<dyn DocumentExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl ToolHandler for DbQueryTool {
    fn descriptor(&self) -> ToolDescriptor {
        let schema = ParamSchema::default()
            .required("collection")
            .property("collection", param(ParamType::String, "Collection to read"))
            .property("query", param(ParamType::Object, "Filter document"))
            .property("projection", param(ParamType::Object, "Fields to include or exclude"))
            .property("sort", param(ParamType::Object, "Field to direction (1 or -1)"))
            .property(
                "limit",
                ParamSpec {
                    default: Some(json!(DEFAULT_QUERY_LIMIT)),
                    ..param(ParamType::Integer, "Maximum documents returned")
                },
            );
        described(
            ToolDescriptor::new("db.query").parameters(schema),
            "Find documents in a collection",
        )
    }

    async fn invoke(&self, ctx: &ToolContext, params: Value) -> Result<Value, ToolError> {
        let collection = collection_param(&params)?;
        ensure_readable(ctx, collection).await?;
        let filter = filter_param(&params)?;

        let mut options = FindOptions {
            limit: Some(query_limit(params.get("limit"))? as usize),
            ..FindOptions::default()
        };
        match params.get("projection") {
            None | Some(Value::Null) => {}
            Some(Value::Object(p)) => options.projection = Some(p.clone()),
            Some(_) => return Err(ToolError::invalid("'projection' must be an object")),
        }
        match params.get("sort") {
            None | Some(Value::Null) => {}
            Some(Value::Object(s)) => {
                options.sort = s
                    .iter()
                    .map(|(field, dir)| (field.clone(), SortOrder::from_direction(dir)))
                    .collect();
            }
            Some(_) => return Err(ToolError::invalid("'sort' must be an object")),
        }

        let documents = self.executor.find(collection, &filter, &options).await?;
        debug!(collection, returned = documents.len(), "db.query executed");
        Ok(json!({
            "collection": collection,
            "count": documents.len(),
            "documents": documents,
        }))
    }
}

/// Limit clamped to `1..=MAX_QUERY_LIMIT`.
fn query_limit(raw: Option<&Value>) -> Result<u64, ToolError> {
    let limit = match raw {
        None | Some(Value::Null) => DEFAULT_QUERY_LIMIT,
        Some(v) => v
            .as_u64()
            .or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .ok_or_else(|| ToolError::invalid("'limit' must be a non-negative number"))?,
    };
    Ok(limit.clamp(1, MAX_QUERY_LIMIT))
}

pub struct DbCountTool {
    executor: Arc<dyn DocumentExecutor>,
}

impl DbCountTool {
    pub fn new(executor: Arc<dyn DocumentExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl ToolHandler for DbCountTool {
    fn descriptor(&self) -> ToolDescriptor {
        let schema = ParamSchema::default()
            .required("collection")
            .property("collection", param(ParamType::String, "Collection to count"))
            .property("query", param(ParamType::Object, "Filter document"));
        described(
            ToolDescriptor::new("db.count").parameters(schema),
            "Count documents matching a filter",
        )
    }

    async fn invoke(&self, ctx: &ToolContext, params: Value) -> Result<Value, ToolError> {
        let collection = collection_param(&params)?;
        ensure_readable(ctx, collection).await?;
        let filter = filter_param(&params)?;
        let count = self.executor.count(collection, &filter).await?;
        Ok(json!({ "collection": collection, "count": count }))
    }
}

pub struct SchemaSearchTool {
    executor: Arc<dyn DocumentExecutor>,
}

impl SchemaSearchTool {
    pub fn new(executor: Arc<dyn DocumentExecutor>) -> Self {
        Self { executor }
    }

    async fn list(&self, ctx: &ToolContext) -> Result<Value, ToolError> {
        let mut collections = self.executor.list_collections().await?;
        let blocked = &ctx.policy.settings().blocked_collection_prefixes;
        collections.retain(|c| !blocked.iter().any(|p| c.name.starts_with(p.as_str())));
        collections.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
        Ok(json!({ "collections": collections }))
    }

    async fn describe(&self, ctx: &ToolContext, collection: &str) -> Result<Value, ToolError> {
        ensure_readable(ctx, collection).await?;
        let fields: Vec<Value> = match self.executor.sample(collection).await? {
            Some(Value::Object(doc)) => infer_fields(&doc),
            _ => Vec::new(),
        };
        Ok(json!({ "collection": collection, "fields": fields }))
    }
}

#[async_trait]
impl ToolHandler for SchemaSearchTool {
    fn descriptor(&self) -> ToolDescriptor {
        let schema = ParamSchema::default().property(
            "collection",
            param(ParamType::String, "Collection to describe; omit to list collections"),
        );
        described(
            ToolDescriptor::new("schema.search").parameters(schema),
            "List collections or describe the fields of one",
        )
    }

    async fn invoke(&self, ctx: &ToolContext, params: Value) -> Result<Value, ToolError> {
        match params.get("collection") {
            None | Some(Value::Null) => self.list(ctx).await,
            Some(_) => {
                let collection = collection_param(&params)?;
                self.describe(ctx, collection).await
            }
        }
    }
}

fn infer_fields(doc: &Map<String, Value>) -> Vec<Value> {
    doc.iter()
        .map(|(name, value)| json!({ "name": name, "type": type_name(value) }))
        .collect()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
