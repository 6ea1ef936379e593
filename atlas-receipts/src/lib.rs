//! Audit trail for tool invocation attempts.
//!
//! Every attempt, allowed or denied, successful or not, becomes one immutable
//! [`AuditRecord`]. Records are addressable by request id, by actor, and in aggregate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error};
use uuid::Uuid;

use atlas_redactor::Sanitizer;

pub mod jsonl;
pub use jsonl::{verify_log, JsonlAuditStore};

pub mod memory;
pub use memory::MemoryAuditStore;

pub mod sqlite;
pub use sqlite::SqliteAuditStore;

pub const MAX_PAGE_LIMIT: u32 = 200;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("io error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("duplicate request id: {0}")]
    Duplicate(String),
    #[error("audit write timed out after {0:?}")]
    Timeout(Duration),
}

/// What the caller knows about one attempt.
#[derive(Clone, Debug, Default)]
pub struct AuditEntry {
    /// Caller-supplied correlation id; a UUID is minted when absent.
    pub request_id: Option<String>,
    pub actor_id: String,
    pub tool_id: String,
    pub params: Value,
    pub success: bool,
    pub reason_code: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub session_id: Option<String>,
    /// Parameters of credential-bearing tools are stored as a digest only.
    pub credential_bearing: bool,
}

/// Immutable stored fact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub request_id: String,
    pub actor_id: String,
    pub tool_id: String,
    pub params: Value,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFilter {
    pub tool_id: Option<String>,
    pub success: Option<bool>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn matches(&self, record: &AuditRecord) -> bool {
        self.tool_id.as_deref().map_or(true, |t| t == record.tool_id)
            && self.success.map_or(true, |s| s == record.success)
            && self.start.map_or(true, |s| record.timestamp >= s)
            && self.end.map_or(true, |e| record.timestamp <= e)
    }
}

/// 1-based page request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 1, limit: 20 }
    }
}

impl PageRequest {
    pub fn new(page: u32, limit: u32) -> Self {
        Self { page, limit }.normalized()
    }

    /// Page 0 reads as page 1; limit is clamped to `1..=MAX_PAGE_LIMIT`.
    pub fn normalized(self) -> Self {
        Self {
            page: self.page.max(1),
            limit: self.limit.clamp(1, MAX_PAGE_LIMIT),
        }
    }

    pub fn offset(&self) -> usize {
        let p = self.normalized();
        (p.page as usize - 1) * p.limit as usize
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditPage {
    pub records: Vec<AuditRecord>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

/// Inclusive time window; either bound may be open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl StatsWindow {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| ts >= s) && self.end.map_or(true, |e| ts <= e)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditStats {
    pub total_calls: u64,
    pub success_calls: u64,
    /// Percentage rounded to two decimals; 0 for an empty window.
    pub success_rate: f64,
}

impl AuditStats {
    pub fn from_counts(total_calls: u64, success_calls: u64) -> Self {
        let success_rate = if total_calls == 0 {
            0.0
        } else {
            let pct = success_calls as f64 / total_calls as f64 * 100.0;
            (pct * 100.0).round() / 100.0
        };
        Self {
            total_calls,
            success_calls,
            success_rate,
        }
    }
}

/// Durable backend for audit records.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Persists one record. A request id that already exists is an error.
    async fn insert(&self, record: &AuditRecord) -> Result<(), AuditError>;

    async fn find_by_request_id(&self, request_id: &str) -> Result<Option<AuditRecord>, AuditError>;

    /// Records of one actor, newest first.
    async fn find_by_actor(
        &self,
        actor_id: &str,
        filter: &AuditFilter,
        page: PageRequest,
    ) -> Result<AuditPage, AuditError>;

    /// `(total, successful)` attempts inside the window.
    async fn counts(&self, window: &StatsWindow) -> Result<(u64, u64), AuditError>;
}

pub struct AuditRecorder {
    store: Arc<dyn AuditStore>,
    sanitizer: Sanitizer,
    write_timeout: Option<Duration>,
}

impl AuditRecorder {
    pub fn new(store: Arc<dyn AuditStore>, sanitizer: Sanitizer) -> Self {
        Self {
            store,
            sanitizer,
            write_timeout: None,
        }
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Persists one attempt and returns the stored record once it has landed.
    ///
    /// Returns `None` when the store fails or times out. The caller keeps going:
    /// whatever the tool did has already happened.
    pub async fn record(&self, entry: AuditEntry) -> Option<AuditRecord> {
        let record = self.seal(entry);
        let write = self.store.insert(&record);
        let outcome = match self.write_timeout {
            Some(limit) => tokio::time::timeout(limit, write)
                .await
                .unwrap_or(Err(AuditError::Timeout(limit))),
            None => write.await,
        };
        match outcome {
            Ok(()) => {
                debug!(request_id = %record.request_id, tool_id = %record.tool_id, "audit record stored");
                Some(record)
            }
            Err(err) => {
                error!(
                    request_id = %record.request_id,
                    actor_id = %record.actor_id,
                    tool_id = %record.tool_id,
                    error = %err,
                    "audit record could not be stored"
                );
                None
            }
        }
    }

    fn seal(&self, entry: AuditEntry) -> AuditRecord {
        let request_id = entry
            .request_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        AuditRecord {
            request_id,
            actor_id: entry.actor_id,
            tool_id: entry.tool_id,
            params: protect_params(&self.sanitizer, entry.params, entry.credential_bearing),
            success: entry.success,
            reason_code: entry.reason_code,
            error_message: entry.error_message,
            duration_ms: entry.duration_ms,
            timestamp: now_millis(),
            session_id: entry.session_id,
        }
    }

    pub async fn get_by_request_id(&self, request_id: &str) -> Result<Option<AuditRecord>, AuditError> {
        self.store.find_by_request_id(request_id).await
    }

    pub async fn get_by_actor(
        &self,
        actor_id: &str,
        filter: &AuditFilter,
        page: PageRequest,
    ) -> Result<AuditPage, AuditError> {
        self.store
            .find_by_actor(actor_id, filter, page.normalized())
            .await
    }

    pub async fn get_stats(&self, window: &StatsWindow) -> Result<AuditStats, AuditError> {
        let (total, success) = self.store.counts(window).await?;
        Ok(AuditStats::from_counts(total, success))
    }
}

/// Masks credential-like fields; credential-bearing tools keep only a digest.
pub fn protect_params(sanitizer: &Sanitizer, params: Value, credential_bearing: bool) -> Value {
    if credential_bearing {
        let digest = Sha256::digest(params.to_string().as_bytes());
        return serde_json::json!({
            "redacted": true,
            "sha256": hex::encode(digest),
        });
    }
    sanitizer.mask(params)
}

/// Current time truncated to milliseconds, the precision every backend keeps.
fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    Utc.timestamp_millis_opt(now.timestamp_millis())
        .single()
        .unwrap_or(now)
}

/// Shared query path for backends that keep records in memory.
pub(crate) fn page_of<'a, I>(records: I, actor_id: &str, filter: &AuditFilter, page: PageRequest) -> AuditPage
where
    I: Iterator<Item = &'a AuditRecord>,
{
    let page = page.normalized();
    let mut hits: Vec<&AuditRecord> = records
        .filter(|r| r.actor_id == actor_id && filter.matches(r))
        .collect();
    // stable sort keeps insertion order reversed for equal timestamps
    hits.reverse();
    hits.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    let total = hits.len() as u64;
    let records = hits
        .into_iter()
        .skip(page.offset())
        .take(page.limit as usize)
        .cloned()
        .collect();
    AuditPage {
        records,
        total,
        page: page.page,
        limit: page.limit,
    }
}

pub(crate) fn counts_of<'a, I>(records: I, window: &StatsWindow) -> (u64, u64)
where
    I: Iterator<Item = &'a AuditRecord>,
{
    records
        .filter(|r| window.contains(r.timestamp))
        .fold((0, 0), |(total, ok), r| (total + 1, ok + u64::from(r.success)))
}
