use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use atlas_cache::CacheStats;
use atlas_policy::{PermissionResolver, PolicyDecision, ResolverCaches};
use atlas_receipts::{AuditEntry, AuditRecorder};
use atlas_redactor::Sanitizer;
use atlas_schema::ParameterValidator;
use atlas_store::{StoreError, ToolDescriptorStore};
use atlas_tools::{ToolContext, ToolError, ToolRegistry};
use atlas_types::{ReasonCode, ToolDescriptor};

use crate::config::GovernanceConfig;
use crate::{Collaborators, ExecutionOutcome, ExecutionResult, ToolRequest, TOOL_NOT_FOUND};

/// What one attempt produced, plus what the audit trail needs to know about it.
struct Attempt {
    result: ExecutionResult,
    params: Value,
    credential_bearing: bool,
}

impl Attempt {
    fn denied(reason_code: ReasonCode, message: String, params: Value, credential_bearing: bool) -> Self {
        Self {
            result: ExecutionResult::Denied {
                reason_code,
                message,
            },
            params,
            credential_bearing,
        }
    }
}

/// Orchestrates one tool call: authorize, validate, run, sanitize, audit.
pub struct GovernanceKernel {
    resolver: Arc<PermissionResolver>,
    tools: Arc<dyn ToolDescriptorStore>,
    validator: ParameterValidator,
    registry: ToolRegistry,
    sanitizer: Sanitizer,
    recorder: AuditRecorder,
}

impl GovernanceKernel {
    pub fn new(
        resolver: Arc<PermissionResolver>,
        tools: Arc<dyn ToolDescriptorStore>,
        validator: ParameterValidator,
        registry: ToolRegistry,
        sanitizer: Sanitizer,
        recorder: AuditRecorder,
    ) -> Self {
        Self {
            resolver,
            tools,
            validator,
            registry,
            sanitizer,
            recorder,
        }
    }

    pub fn from_config(config: &GovernanceConfig, parts: Collaborators) -> Self {
        let caches = ResolverCaches::new(config.cache.actor_capacity, config.cache.tool_capacity);
        let resolver = PermissionResolver::new(
            parts.actors,
            parts.tools.clone(),
            caches,
            config.policy_settings(),
        );
        let validator = ParameterValidator::new(parts.tools.clone())
            .with_forbidden_operators(&config.validator.forbidden_operators);
        let sanitizer = Sanitizer::new(&config.sanitizer);
        let mut recorder = AuditRecorder::new(parts.audit, sanitizer.clone());
        if let Some(ms) = config.audit.write_timeout_ms {
            recorder = recorder.with_write_timeout(Duration::from_millis(ms));
        }
        Self::new(
            Arc::new(resolver),
            parts.tools,
            validator,
            parts.registry,
            sanitizer,
            recorder,
        )
    }

    pub fn resolver(&self) -> &Arc<PermissionResolver> {
        &self.resolver
    }

    pub fn recorder(&self) -> &AuditRecorder {
        &self.recorder
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// `(actor cache, tool cache)` counters.
    pub fn cache_stats(&self) -> (CacheStats, CacheStats) {
        let caches = self.resolver.caches();
        (caches.actors.stats(), caches.tools.stats())
    }

    /// Runs one attempt end to end. Never fails: every outcome, including a denial, is a
    /// result, and every attempt is handed to the audit recorder.
    pub async fn execute(&self, request: ToolRequest) -> ExecutionOutcome {
        let started = Instant::now();
        let request_id = request
            .request_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let span = info_span!(
            "tool_call",
            request_id = %request_id,
            actor_id = %request.actor_id,
            tool_id = %request.tool_id
        );

        async move {
            let attempt = self.attempt(&request, &request_id).await;
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            let entry = AuditEntry {
                request_id: Some(request_id.clone()),
                actor_id: request.actor_id,
                tool_id: request.tool_id,
                params: attempt.params,
                success: attempt.result.is_success(),
                reason_code: attempt.result.reason().map(String::from),
                error_message: attempt.result.message().map(String::from),
                duration_ms,
                session_id: request.session_id,
                credential_bearing: attempt.credential_bearing,
            };
            let audited = self.recorder.record(entry).await.is_some();
            if !audited {
                warn!("attempt finished without an audit record");
            }
            ExecutionOutcome {
                request_id,
                audited,
                duration_ms,
                result: attempt.result,
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, request: &ToolRequest, request_id: &str) -> Attempt {
        let actor_id = request.actor_id.as_str();
        let tool_id = request.tool_id.as_str();

        if let PolicyDecision::Deny { reason, message } =
            self.resolver.check_tool_permission(actor_id, tool_id).await
        {
            // an unreadable descriptor counts as credential-bearing
            let credential_bearing = self
                .descriptor(tool_id)
                .await
                .map_or(true, |d| d.is_some_and(|d| d.credential_bearing));
            return Attempt::denied(reason, message, request.params.clone(), credential_bearing);
        }

        let descriptor = match self.descriptor(tool_id).await {
            Ok(descriptor) => descriptor,
            Err(err) => {
                error!(error = %err, "tool descriptor lookup failed");
                return Attempt::denied(
                    ReasonCode::InternalCheckError,
                    format!("descriptor for tool '{tool_id}' could not be loaded: {err}"),
                    request.params.clone(),
                    true,
                );
            }
        };
        let validated = match self
            .validator
            .validate_against(tool_id, descriptor.as_ref(), request.params.clone())
        {
            Ok(validated) => validated,
            Err(err) => {
                warn!(reason = %err.code(), error = %err, "parameters rejected");
                let credential_bearing = descriptor.as_ref().is_some_and(|d| d.credential_bearing);
                return Attempt::denied(
                    err.code(),
                    err.to_string(),
                    request.params.clone(),
                    credential_bearing,
                );
            }
        };
        debug!(defaults = ?validated.defaults_applied, "parameters validated");
        let credential_bearing = validated.credential_bearing;
        let params = validated.into_value();

        let Some(handler) = self.registry.get(tool_id) else {
            warn!("no handler registered");
            return Attempt {
                result: ExecutionResult::Failed {
                    error: ToolError::new(
                        TOOL_NOT_FOUND,
                        format!("no handler registered for tool '{tool_id}'"),
                    ),
                },
                params,
                credential_bearing,
            };
        };

        let ctx = ToolContext {
            actor_id: actor_id.to_string(),
            session_id: request.session_id.clone(),
            request_id: request_id.to_string(),
            policy: self.resolver.clone(),
        };
        let result = match handler.invoke(&ctx, params.clone()).await {
            Ok(data) => {
                info!("tool call completed");
                ExecutionResult::Completed {
                    data: self.sanitizer.sanitize(data),
                }
            }
            Err(error) => {
                warn!(code = %error.code, message = %error.message, "tool call failed");
                ExecutionResult::Failed { error }
            }
        };
        Attempt {
            result,
            params,
            credential_bearing,
        }
    }

    async fn descriptor(&self, tool_id: &str) -> Result<Option<ToolDescriptor>, StoreError> {
        let lookup = self.tools.find_by_tool_id(tool_id);
        match self.resolver.settings().store_timeout {
            Some(limit) => tokio::time::timeout(limit, lookup)
                .await
                .map_err(|_| StoreError::Timeout(limit))?,
            None => lookup.await,
        }
    }
}
