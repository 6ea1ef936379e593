use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use atlas_types::{Actor, ToolDescriptor};

use crate::{ActorStore, StoreError, ToolDescriptorStore};

/// Knobs shared by the in-memory stores so tests can observe and disturb store traffic.
#[derive(Default)]
struct Probe {
    reads: AtomicUsize,
    unavailable: AtomicBool,
    latency: Option<Duration>,
}

impl Probe {
    async fn enter(&self, what: &str) -> Result<(), StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("{what} store offline")));
        }
        Ok(())
    }
}

/// In-memory identity store.
///
/// NOTE: not durable; meant for fixtures, the CLI and tests.
#[derive(Default)]
pub struct InMemoryActorStore {
    actors: RwLock<HashMap<String, Actor>>,
    probe: Probe,
}

impl InMemoryActorStore {
    pub fn new(actors: impl IntoIterator<Item = Actor>) -> Self {
        Self {
            actors: RwLock::new(actors.into_iter().map(|a| (a.id.clone(), a)).collect()),
            probe: Probe::default(),
        }
    }

    /// Every lookup sleeps for `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.probe.latency = Some(latency);
        self
    }

    pub async fn upsert(&self, actor: Actor) {
        self.actors.write().await.insert(actor.id.clone(), actor);
    }

    pub async fn remove(&self, actor_id: &str) -> Option<Actor> {
        self.actors.write().await.remove(actor_id)
    }

    /// Number of `find_by_id` calls served so far.
    pub fn reads(&self) -> usize {
        self.probe.reads.load(Ordering::SeqCst)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.probe.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl ActorStore for InMemoryActorStore {
    async fn find_by_id(&self, actor_id: &str) -> Result<Option<Actor>, StoreError> {
        self.probe.enter("actor").await?;
        Ok(self.actors.read().await.get(actor_id).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryToolStore {
    tools: RwLock<HashMap<String, ToolDescriptor>>,
    probe: Probe,
}

impl InMemoryToolStore {
    pub fn new(tools: impl IntoIterator<Item = ToolDescriptor>) -> Self {
        Self {
            tools: RwLock::new(tools.into_iter().map(|t| (t.tool_id.clone(), t)).collect()),
            probe: Probe::default(),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.probe.latency = Some(latency);
        self
    }

    pub async fn upsert(&self, tool: ToolDescriptor) {
        self.tools.write().await.insert(tool.tool_id.clone(), tool);
    }

    pub async fn remove(&self, tool_id: &str) -> Option<ToolDescriptor> {
        self.tools.write().await.remove(tool_id)
    }

    pub fn reads(&self) -> usize {
        self.probe.reads.load(Ordering::SeqCst)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.probe.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl ToolDescriptorStore for InMemoryToolStore {
    async fn find_by_tool_id(&self, tool_id: &str) -> Result<Option<ToolDescriptor>, StoreError> {
        self.probe.enter("tool").await?;
        Ok(self.tools.read().await.get(tool_id).cloned())
    }
}
