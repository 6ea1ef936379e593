use std::cmp::Ordering;
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::{CollectionInfo, DocumentExecutor, FindOptions, SortOrder, StoreError};

/// In-memory document collections with a small Mongo-flavoured filter language:
/// equality, `$eq $ne $gt $gte $lt $lte $in $nin $exists`, and top-level `$and`/`$or`.
///
/// NOTE: not durable; the CLI seeds it from fixtures.
#[derive(Default)]
pub struct InMemoryDocumentExecutor {
    collections: RwLock<BTreeMap<String, Vec<Value>>>,
}

impl InMemoryDocumentExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(self, name: impl Into<String>, docs: Vec<Value>) -> Self {
        let mut collections = self.collections.into_inner();
        collections.insert(name.into(), docs);
        Self {
            collections: RwLock::new(collections),
        }
    }

    pub async fn insert(&self, collection: &str, doc: Value) {
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .push(doc);
    }
}

#[async_trait]
impl DocumentExecutor for InMemoryDocumentExecutor {
    async fn find(
        &self,
        collection: &str,
        filter: &Value,
        options: &FindOptions,
    ) -> Result<Vec<Value>, StoreError> {
        let collections = self.collections.read().await;
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<&Value> = docs.iter().filter(|d| matches_filter(d, filter)).collect();
        if !options.sort.is_empty() {
            hits.sort_by(|a, b| {
                for (field, order) in &options.sort {
                    let ord = compare_opt(lookup(a, field), lookup(b, field));
                    let ord = match order {
                        SortOrder::Ascending => ord,
                        SortOrder::Descending => ord.reverse(),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }
        let limit = options.limit.unwrap_or(usize::MAX);
        Ok(hits
            .into_iter()
            .take(limit)
            .map(|d| project(d, options.projection.as_ref()))
            .collect())
    }

    async fn count(&self, collection: &str, filter: &Value) -> Result<u64, StoreError> {
        let collections = self.collections.read().await;
        let n = collections
            .get(collection)
            .map(|docs| docs.iter().filter(|d| matches_filter(d, filter)).count())
            .unwrap_or(0);
        Ok(n as u64)
    }

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .iter()
            .map(|(name, docs)| CollectionInfo {
                name: name.clone(),
                count: docs.len() as u64,
            })
            .collect())
    }

    async fn sample(&self, collection: &str) -> Result<Option<Value>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections.get(collection).and_then(|docs| docs.first().cloned()))
    }
}

/// Resolves a dotted path (`address.city`) inside a document.
fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |cur, seg| cur.get(seg))
}

pub fn matches_filter(doc: &Value, filter: &Value) -> bool {
    let Some(clauses) = filter.as_object() else {
        // null / absent filter selects everything
        return filter.is_null();
    };
    clauses.iter().all(|(key, cond)| match key.as_str() {
        "$and" => cond
            .as_array()
            .is_some_and(|subs| subs.iter().all(|f| matches_filter(doc, f))),
        "$or" => cond
            .as_array()
            .is_some_and(|subs| subs.iter().any(|f| matches_filter(doc, f))),
        field => matches_condition(lookup(doc, field), cond),
    })
}

fn matches_condition(field: Option<&Value>, cond: &Value) -> bool {
    match cond.as_object() {
        Some(ops) if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) => {
            ops.iter().all(|(op, arg)| apply_operator(field, op, arg))
        }
        _ => equals(field, cond),
    }
}

fn equals(field: Option<&Value>, expected: &Value) -> bool {
    match field {
        Some(Value::Array(items)) if !expected.is_array() => items.contains(expected),
        Some(v) => v == expected,
        None => expected.is_null(),
    }
}

fn apply_operator(field: Option<&Value>, op: &str, arg: &Value) -> bool {
    match op {
        "$eq" => equals(field, arg),
        "$ne" => !equals(field, arg),
        "$gt" => compare(field, arg) == Some(Ordering::Greater),
        "$gte" => matches!(compare(field, arg), Some(Ordering::Greater | Ordering::Equal)),
        "$lt" => compare(field, arg) == Some(Ordering::Less),
        "$lte" => matches!(compare(field, arg), Some(Ordering::Less | Ordering::Equal)),
        "$in" => arg
            .as_array()
            .is_some_and(|set| set.iter().any(|v| equals(field, v))),
        "$nin" => arg
            .as_array()
            .is_some_and(|set| !set.iter().any(|v| equals(field, v))),
        "$exists" => field.is_some() == arg.as_bool().unwrap_or(true),
        _ => false,
    }
}

fn compare(field: Option<&Value>, arg: &Value) -> Option<Ordering> {
    let field = field?;
    match (field, arg) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Sort order across types: missing and null, then bool, number, string, object, array.
/// Objects and arrays keep their input order among themselves.
fn compare_opt(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let (a, b) = (a.unwrap_or(&Value::Null), b.unwrap_or(&Value::Null));
    type_rank(a).cmp(&type_rank(b)).then_with(|| match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .zip(y.as_f64())
            .and_then(|(x, y)| x.partial_cmp(&y))
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => Ordering::Equal,
    })
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Object(_) => 4,
        Value::Array(_) => 5,
    }
}

fn project(doc: &Value, projection: Option<&Map<String, Value>>) -> Value {
    let (Some(projection), Some(obj)) = (projection, doc.as_object()) else {
        return doc.clone();
    };
    if projection.is_empty() {
        return doc.clone();
    }
    let truthy = |v: &Value| v.as_i64().map(|n| n != 0).or_else(|| v.as_bool()).unwrap_or(true);
    let including = projection
        .iter()
        .any(|(k, v)| k != "_id" && truthy(v));
    let mut out = Map::new();
    for (key, value) in obj {
        let keep = match projection.get(key) {
            Some(flag) => truthy(flag),
            None if key == "_id" => true,
            None => !including,
        };
        if keep {
            out.insert(key.clone(), value.clone());
        }
    }
    Value::Object(out)
}
