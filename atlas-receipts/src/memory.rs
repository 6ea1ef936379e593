use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    counts_of, page_of, AuditError, AuditFilter, AuditPage, AuditRecord, AuditStore, PageRequest,
    StatsWindow,
};

/// Process-local audit store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryAuditStore {
    inner: RwLock<Records>,
}

#[derive(Default)]
pub(crate) struct Records {
    pub(crate) rows: Vec<AuditRecord>,
    pub(crate) by_request: HashMap<String, usize>,
}

impl Records {
    pub(crate) fn push(&mut self, record: AuditRecord) -> Result<(), AuditError> {
        if self.by_request.contains_key(&record.request_id) {
            return Err(AuditError::Duplicate(record.request_id));
        }
        self.by_request
            .insert(record.request_id.clone(), self.rows.len());
        self.rows.push(record);
        Ok(())
    }

    pub(crate) fn get(&self, request_id: &str) -> Option<&AuditRecord> {
        self.by_request.get(request_id).map(|&i| &self.rows[i])
    }
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.rows.len()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn insert(&self, record: &AuditRecord) -> Result<(), AuditError> {
        self.inner.write().await.push(record.clone())
    }

    async fn find_by_request_id(&self, request_id: &str) -> Result<Option<AuditRecord>, AuditError> {
        Ok(self.inner.read().await.get(request_id).cloned())
    }

    async fn find_by_actor(
        &self,
        actor_id: &str,
        filter: &AuditFilter,
        page: PageRequest,
    ) -> Result<AuditPage, AuditError> {
        let inner = self.inner.read().await;
        Ok(page_of(inner.rows.iter(), actor_id, filter, page))
    }

    async fn counts(&self, window: &StatsWindow) -> Result<(u64, u64), AuditError> {
        let inner = self.inner.read().await;
        Ok(counts_of(inner.rows.iter(), window))
    }
}
