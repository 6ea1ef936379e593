//! Append-only JSONL audit log with a SHA-256 hash chain.
//!
//! Each line is one record plus `prev_hash` and `chain_hash`. Rewriting or dropping a
//! line breaks the chain, which [`verify_log`] reports. Queries are served from an
//! in-memory index rebuilt on open, so one process should own the file.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::memory::Records;
use crate::{
    counts_of, page_of, AuditError, AuditFilter, AuditPage, AuditRecord, AuditStore, PageRequest,
    StatsWindow,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainedRecord {
    #[serde(flatten)]
    pub record: AuditRecord,
    pub prev_hash: Option<String>,
    pub chain_hash: String,
}

struct LogState {
    records: Records,
    last_hash: Option<String>,
}

pub struct JsonlAuditStore {
    path: PathBuf,
    state: Mutex<LogState>,
}

impl JsonlAuditStore {
    /// Opens (or creates) the log and rebuilds the index.
    ///
    /// A final line that does not parse is what an interrupted append leaves behind; it is
    /// cut off with a warning. A bad line anywhere else is an error.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(io_err(e)),
        };

        let mut records = Records::default();
        let mut last_hash = None;
        let mut offset = 0usize;
        let mut lines = bytes.split_inclusive(|b| *b == b'\n');
        while let Some(raw) = lines.next() {
            let line_start = offset;
            offset += raw.len();
            let text = String::from_utf8_lossy(raw);
            if text.trim().is_empty() {
                continue;
            }
            let chained = match serde_json::from_str::<ChainedRecord>(text.trim_end()) {
                Ok(chained) => chained,
                Err(e) if is_tail(lines.clone()) => {
                    warn!(
                        path = %path.display(),
                        offset = line_start,
                        error = %e,
                        "truncating incomplete final audit line"
                    );
                    truncate(&path, line_start as u64)?;
                    break;
                }
                Err(e) => return Err(AuditError::Parse(e.to_string())),
            };
            if !raw.ends_with(b"\n") {
                // complete record whose newline never made it to disk
                append_bytes(&path, b"\n")?;
            }
            last_hash = Some(chained.chain_hash);
            records.push(chained.record)?;
        }
        info!(path = %path.display(), records = records.rows.len(), "audit log opened");
        Ok(Self {
            path,
            state: Mutex::new(LogState { records, last_hash }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditStore for JsonlAuditStore {
    async fn insert(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut state = self.state.lock().await;
        if state.records.get(&record.request_id).is_some() {
            return Err(AuditError::Duplicate(record.request_id.clone()));
        }
        let prev_hash = state.last_hash.clone();
        let chain_hash = hash_record(record, prev_hash.as_deref())?;
        let chained = ChainedRecord {
            record: record.clone(),
            prev_hash,
            chain_hash,
        };
        let mut line = serde_json::to_string(&chained).map_err(|e| AuditError::Parse(e.to_string()))?;
        line.push('\n');

        // the lock stays held so appends keep chain order
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || append_bytes(&path, line.as_bytes()))
            .await
            .map_err(|e| AuditError::Storage(e.to_string()))??;

        state.last_hash = Some(chained.chain_hash);
        state.records.push(chained.record)
    }

    async fn find_by_request_id(&self, request_id: &str) -> Result<Option<AuditRecord>, AuditError> {
        Ok(self.state.lock().await.records.get(request_id).cloned())
    }

    async fn find_by_actor(
        &self,
        actor_id: &str,
        filter: &AuditFilter,
        page: PageRequest,
    ) -> Result<AuditPage, AuditError> {
        let state = self.state.lock().await;
        Ok(page_of(state.records.rows.iter(), actor_id, filter, page))
    }

    async fn counts(&self, window: &StatsWindow) -> Result<(u64, u64), AuditError> {
        let state = self.state.lock().await;
        Ok(counts_of(state.records.rows.iter(), window))
    }
}

/// Walks the whole log and checks every link. Returns the number of records verified.
pub fn verify_log(path: impl AsRef<Path>) -> Result<usize, AuditError> {
    let mut prev: Option<String> = None;
    let mut verified = 0;
    for (n, line) in read_lines(path.as_ref())?.enumerate() {
        let chained = line?;
        if chained.prev_hash != prev {
            return Err(AuditError::Parse(format!("hash chain mismatch at line {}", n + 1)));
        }
        let expected = hash_record(&chained.record, chained.prev_hash.as_deref())?;
        if chained.chain_hash != expected {
            return Err(AuditError::Parse(format!("chain hash invalid at line {}", n + 1)));
        }
        prev = Some(chained.chain_hash);
        verified += 1;
    }
    Ok(verified)
}

/// Reads every chained record of a log; a missing file reads as empty.
pub fn read_log(path: impl AsRef<Path>) -> Result<Vec<ChainedRecord>, AuditError> {
    read_lines(path.as_ref())?.collect()
}

fn read_lines(
    path: &Path,
) -> Result<impl Iterator<Item = Result<ChainedRecord, AuditError>>, AuditError> {
    let lines = if path.exists() {
        let file = File::open(path).map_err(|e| AuditError::Io(e.to_string()))?;
        Some(BufReader::new(file).lines())
    } else {
        None
    };
    Ok(lines
        .into_iter()
        .flatten()
        .filter(|line| line.as_ref().map_or(true, |l| !l.trim().is_empty()))
        .map(|line| {
            let line = line.map_err(|e| AuditError::Io(e.to_string()))?;
            serde_json::from_str(&line).map_err(|e| AuditError::Parse(e.to_string()))
        }))
}

fn io_err(e: io::Error) -> AuditError {
    AuditError::Io(e.to_string())
}

/// Whether only blank lines remain.
fn is_tail<'a>(mut rest: impl Iterator<Item = &'a [u8]>) -> bool {
    rest.all(|l| l.iter().all(u8::is_ascii_whitespace))
}

fn truncate(path: &Path, len: u64) -> Result<(), AuditError> {
    OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|f| f.set_len(len).and_then(|()| f.sync_data()))
        .map_err(io_err)
}

/// Appends and syncs, or leaves the file at its previous length.
fn append_bytes(path: &Path, bytes: &[u8]) -> Result<(), AuditError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err)?;
    rollback_on_error(&mut file, |f| {
        f.write_all(bytes)?;
        f.sync_data()
    })
}

fn rollback_on_error(
    file: &mut File,
    write: impl FnOnce(&mut File) -> io::Result<()>,
) -> Result<(), AuditError> {
    let len = file.metadata().map_err(io_err)?.len();
    if let Err(err) = write(file) {
        if let Err(trunc) = file.set_len(len) {
            error!(error = %trunc, "could not roll back failed audit append");
        }
        return Err(io_err(err));
    }
    Ok(())
}

fn hash_record(record: &AuditRecord, prev_hash: Option<&str>) -> Result<String, AuditError> {
    let body = serde_json::to_string(record).map_err(|e| AuditError::Parse(e.to_string()))?;
    let mut h = Sha256::new();
    h.update(body.as_bytes());
    if let Some(prev) = prev_hash {
        h.update(prev.as_bytes());
    }
    Ok(format!("{:x}", h.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn record(id: &str, actor: &str, success: bool) -> AuditRecord {
        AuditRecord {
            request_id: id.into(),
            actor_id: actor.into(),
            tool_id: "db.query".into(),
            params: json!({"collection": "clients", "limit": 10}),
            success,
            reason_code: (!success).then(|| "PERMISSION_DENIED".to_string()),
            error_message: None,
            duration_ms: 3,
            timestamp: Utc::now(),
            session_id: None,
        }
    }

    #[tokio::test]
    async fn chain_verifies_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit/log.jsonl");
        {
            let log = JsonlAuditStore::open(&path).unwrap();
            log.insert(&record("a", "u1", true)).await.unwrap();
            log.insert(&record("b", "u1", false)).await.unwrap();
        }
        assert_eq!(verify_log(&path).unwrap(), 2);

        let reopened = JsonlAuditStore::open(&path).unwrap();
        let found = reopened.find_by_request_id("b").await.unwrap().unwrap();
        assert_eq!(found.reason_code.as_deref(), Some("PERMISSION_DENIED"));
        reopened.insert(&record("c", "u2", true)).await.unwrap();
        assert_eq!(verify_log(&path).unwrap(), 3);
        assert_eq!(reopened.counts(&StatsWindow::default()).await.unwrap(), (3, 2));

        let chain = read_log(&path).unwrap();
        assert_eq!(chain[2].prev_hash.as_deref(), Some(chain[1].chain_hash.as_str()));
    }

    #[tokio::test]
    async fn duplicates_rejected_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let log = JsonlAuditStore::open(&path).unwrap();
        log.insert(&record("a", "u1", true)).await.unwrap();
        let err = log.insert(&record("a", "u1", true)).await.unwrap_err();
        assert!(matches!(err, AuditError::Duplicate(_)));
        assert_eq!(read_log(&path).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tampering_breaks_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let log = JsonlAuditStore::open(&path).unwrap();
        log.insert(&record("a", "u1", false)).await.unwrap();
        log.insert(&record("b", "u1", true)).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let forged = text.replacen("\"success\":false", "\"success\":true", 1);
        assert_ne!(text, forged);
        std::fs::write(&path, forged).unwrap();
        assert!(verify_log(&path).is_err());
    }

    #[tokio::test]
    async fn torn_final_line_is_cut_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        {
            let log = JsonlAuditStore::open(&path).unwrap();
            log.insert(&record("a", "u1", true)).await.unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"request_id":"b","act"#).unwrap();
        drop(file);
        assert!(verify_log(&path).is_err());

        let reopened = JsonlAuditStore::open(&path).unwrap();
        assert!(reopened.find_by_request_id("b").await.unwrap().is_none());
        reopened.insert(&record("b", "u1", true)).await.unwrap();
        assert_eq!(verify_log(&path).unwrap(), 2);
    }

    #[tokio::test]
    async fn corrupt_line_before_the_tail_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        {
            let log = JsonlAuditStore::open(&path).unwrap();
            log.insert(&record("a", "u1", true)).await.unwrap();
            log.insert(&record("b", "u1", true)).await.unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, format!("{{broken\n{text}")).unwrap();
        assert!(matches!(JsonlAuditStore::open(&path), Err(AuditError::Parse(_))));
    }

    #[tokio::test]
    async fn missing_trailing_newline_is_restored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        {
            let log = JsonlAuditStore::open(&path).unwrap();
            log.insert(&record("a", "u1", true)).await.unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.trim_end()).unwrap();

        let reopened = JsonlAuditStore::open(&path).unwrap();
        reopened.insert(&record("b", "u2", true)).await.unwrap();
        assert_eq!(verify_log(&path).unwrap(), 2);
    }

    #[tokio::test]
    async fn failed_append_leaves_no_partial_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let log = JsonlAuditStore::open(&path).unwrap();
        log.insert(&record("a", "u1", true)).await.unwrap();
        let before = std::fs::metadata(&path).unwrap().len();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        let err = rollback_on_error(&mut file, |f| {
            f.write_all(br#"{"request_id":"half"#)?;
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        })
        .unwrap_err();
        assert!(matches!(err, AuditError::Io(_)));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), before);

        log.insert(&record("b", "u1", true)).await.unwrap();
        assert_eq!(verify_log(&path).unwrap(), 2);
    }

    #[test]
    fn missing_log_verifies_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(verify_log(dir.path().join("none.jsonl")).unwrap(), 0);
    }
}
