use std::future::Future;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use atlas_cache::LruCache;
use atlas_store::{ActorStore, StoreError, ToolDescriptorStore};
use atlas_types::{PermissionSet, ReasonCode};

use crate::requirement::{default_chain, Requirement, RequirementSource};
use crate::{CollectionOp, PolicyDecision, PolicyError, PolicySettings};

/// The two cache instances the resolver reads through.
///
/// Built once at process start and handed in, so other components can share
/// (and invalidate) the very same instances.
#[derive(Clone)]
pub struct ResolverCaches {
    pub actors: Arc<LruCache<String, PermissionSet>>,
    /// `None` values mean "no permission required".
    pub tools: Arc<LruCache<String, Option<String>>>,
}

impl ResolverCaches {
    pub fn new(actor_capacity: usize, tool_capacity: usize) -> Self {
        Self {
            actors: Arc::new(LruCache::new(actor_capacity)),
            tools: Arc::new(LruCache::new(tool_capacity)),
        }
    }
}

pub struct PermissionResolver {
    actors: Arc<dyn ActorStore>,
    tools: Arc<dyn ToolDescriptorStore>,
    caches: ResolverCaches,
    sources: Vec<Box<dyn RequirementSource>>,
    settings: PolicySettings,
}

impl PermissionResolver {
    pub fn new(
        actors: Arc<dyn ActorStore>,
        tools: Arc<dyn ToolDescriptorStore>,
        caches: ResolverCaches,
        settings: PolicySettings,
    ) -> Self {
        let sources = default_chain(settings.static_requirements.clone());
        Self {
            actors,
            tools,
            caches,
            sources,
            settings,
        }
    }

    /// Replaces the requirement resolution chain.
    pub fn with_sources(mut self, sources: Vec<Box<dyn RequirementSource>>) -> Self {
        self.sources = sources;
        self
    }

    pub fn settings(&self) -> &PolicySettings {
        &self.settings
    }

    pub fn caches(&self) -> &ResolverCaches {
        &self.caches
    }

    /// Decides whether `actor_id` may invoke `tool_id`. Never fails: any error while
    /// resolving becomes an `INTERNAL_CHECK_ERROR` denial.
    pub async fn check_tool_permission(&self, actor_id: &str, tool_id: &str) -> PolicyDecision {
        let decision = match self.evaluate_tool(actor_id, tool_id).await {
            Ok(decision) => decision,
            Err(err) => {
                error!(actor_id, tool_id, error = %err, "tool permission check failed");
                PolicyDecision::deny(
                    ReasonCode::InternalCheckError,
                    format!("permission check for tool '{tool_id}' could not be completed: {err}"),
                )
            }
        };
        match &decision {
            PolicyDecision::Allow => info!(actor_id, tool_id, "tool call allowed"),
            PolicyDecision::Deny { reason, .. } => {
                warn!(actor_id, tool_id, reason = %reason, "tool call denied")
            }
        }
        decision
    }

    async fn evaluate_tool(
        &self,
        actor_id: &str,
        tool_id: &str,
    ) -> Result<PolicyDecision, PolicyError> {
        let Some(perms) = self.actor_permissions(actor_id).await? else {
            return Ok(actor_not_found(actor_id));
        };
        if perms.has_super() {
            return Ok(PolicyDecision::Allow);
        }
        if self.settings.default_allow.contains(tool_id) {
            debug!(tool_id, "tool is on the default-allow list");
            return Ok(PolicyDecision::Allow);
        }
        let Some(required) = self.tool_requirement(tool_id).await? else {
            return Ok(PolicyDecision::Allow);
        };
        if perms.contains_exact(&required) || perms.covers_by_wildcard(&required) {
            return Ok(PolicyDecision::Allow);
        }
        Ok(PolicyDecision::deny(
            ReasonCode::PermissionDenied,
            format!("missing permission '{required}' required by tool '{tool_id}'"),
        ))
    }

    /// Read/write access to a named collection, independent of any tool id.
    pub async fn check_collection_permission(
        &self,
        actor_id: &str,
        resource: &str,
        op: CollectionOp,
    ) -> PolicyDecision {
        match self.evaluate_collection(actor_id, resource, op).await {
            Ok(decision) => {
                if let PolicyDecision::Deny { reason, .. } = &decision {
                    warn!(actor_id, resource, ?op, reason = %reason, "collection access denied");
                }
                decision
            }
            Err(err) => {
                error!(actor_id, resource, error = %err, "collection permission check failed");
                PolicyDecision::deny(
                    ReasonCode::InternalCheckError,
                    format!("permission check for collection '{resource}' could not be completed: {err}"),
                )
            }
        }
    }

    async fn evaluate_collection(
        &self,
        actor_id: &str,
        resource: &str,
        op: CollectionOp,
    ) -> Result<PolicyDecision, PolicyError> {
        let Some(perms) = self.actor_permissions(actor_id).await? else {
            return Ok(actor_not_found(actor_id));
        };
        if perms.has_super() {
            return Ok(PolicyDecision::Allow);
        }
        if self
            .settings
            .blocked_collection_prefixes
            .iter()
            .any(|p| resource.starts_with(p.as_str()))
        {
            return Ok(PolicyDecision::deny(
                ReasonCode::PermissionDenied,
                format!("collection '{resource}' is restricted"),
            ));
        }
        let required = match op {
            CollectionOp::Read => &self.settings.collection_read,
            CollectionOp::Write => &self.settings.collection_write,
        };
        if perms.contains_exact(required) || perms.covers_by_wildcard(required) {
            return Ok(PolicyDecision::Allow);
        }
        Ok(PolicyDecision::deny(
            ReasonCode::PermissionDenied,
            format!("missing permission '{required}' to access collection '{resource}'"),
        ))
    }

    /// Resolved permissions of an actor, cache first. `Ok(None)` when the actor does not exist.
    pub async fn actor_permissions(
        &self,
        actor_id: &str,
    ) -> Result<Option<PermissionSet>, PolicyError> {
        let key = actor_id.to_string();
        if let Some(hit) = self.caches.actors.get(&key) {
            if hit.is_fresh(self.settings.actor_ttl) {
                debug!(actor_id, "actor permission cache hit");
                return Ok(Some(hit.value));
            }
            debug!(actor_id, age = ?hit.age(), "actor permission cache entry stale");
        }
        let Some(actor) = self.guarded(self.actors.find_by_id(actor_id)).await? else {
            // nonexistence is not cached: the actor may be provisioned at any moment
            return Ok(None);
        };
        let perms = actor.effective_permissions();
        self.caches.actors.set(key, perms.clone());
        Ok(Some(perms))
    }

    /// Resolved requirement of a tool, cache first. `Ok(None)` means no permission is needed.
    pub async fn tool_requirement(&self, tool_id: &str) -> Result<Option<String>, PolicyError> {
        let key = tool_id.to_string();
        if let Some(hit) = self.caches.tools.get(&key) {
            if hit.is_fresh(self.settings.tool_ttl) {
                debug!(tool_id, "tool requirement cache hit");
                return Ok(hit.value);
            }
        }
        let descriptor = self.guarded(self.tools.find_by_tool_id(tool_id)).await?;
        let resolved = self.sources.iter().find_map(|source| {
            let found = source.resolve(tool_id, descriptor.as_ref())?;
            debug!(tool_id, source = source.name(), requirement = ?found, "tool requirement resolved");
            Some(found)
        });
        let required = resolved.and_then(Requirement::into_permission);
        self.caches.tools.set(key, required.clone());
        Ok(required)
    }

    pub fn clear_actor_cache(&self, actor_id: Option<&str>) {
        match actor_id {
            Some(id) => {
                self.caches.actors.delete(&id.to_string());
            }
            None => self.caches.actors.clear(),
        }
    }

    pub fn clear_tool_cache(&self, tool_id: Option<&str>) {
        match tool_id {
            Some(id) => {
                self.caches.tools.delete(&id.to_string());
            }
            None => self.caches.tools.clear(),
        }
    }

    pub fn clear_all(&self) {
        self.caches.actors.clear();
        self.caches.tools.clear();
    }

    async fn guarded<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match self.settings.store_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| StoreError::Timeout(limit))?,
            None => call.await,
        }
    }
}

fn actor_not_found(actor_id: &str) -> PolicyDecision {
    PolicyDecision::deny(
        ReasonCode::ActorNotFound,
        format!("actor '{actor_id}' does not exist"),
    )
}
