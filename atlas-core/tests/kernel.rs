use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use atlas_core::{
    Collaborators, ExecutionResult, Fixtures, GovernanceConfig, GovernanceKernel, ToolRequest,
    TOOL_NOT_FOUND,
};
use atlas_receipts::{
    AuditError, AuditFilter, AuditPage, AuditRecord, AuditStore, MemoryAuditStore, PageRequest,
    StatsWindow,
};
use atlas_store::{InMemoryActorStore, InMemoryDocumentExecutor, InMemoryToolStore};
use atlas_tools::{builtin_registry, ToolContext, ToolError, ToolHandler};
use atlas_types::{Actor, ParamSchema, ParamSpec, ReasonCode, Role, ToolDescriptor};

struct VaultRotate;

#[async_trait]
impl ToolHandler for VaultRotate {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new("vault.rotate")
            .requires("ai:vault.write")
            .credential_bearing()
            .parameters(ParamSchema::default().required("path"))
    }

    async fn invoke(&self, _ctx: &ToolContext, params: Value) -> Result<Value, ToolError> {
        Ok(json!({"path": params["path"], "rotated": true, "api_key": "new-key"}))
    }
}

struct FlakyCrm;

#[async_trait]
impl ToolHandler for FlakyCrm {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new("crm.search_clients").parameters(
            ParamSchema::default().property(
                "status",
                ParamSpec {
                    allowed: Some(vec![json!("active"), json!("inactive")]),
                    ..ParamSpec::default()
                },
            ),
        )
    }

    async fn invoke(&self, _ctx: &ToolContext, _params: Value) -> Result<Value, ToolError> {
        Err(ToolError::new("UPSTREAM_DOWN", "crm backend unreachable"))
    }
}

struct Harness {
    kernel: GovernanceKernel,
    audit: Arc<MemoryAuditStore>,
    tools: Arc<InMemoryToolStore>,
}

fn harness() -> Harness {
    let audit = Arc::new(MemoryAuditStore::new());
    harness_with_audit(audit.clone(), audit)
}

fn harness_with_audit(audit: Arc<MemoryAuditStore>, store: Arc<dyn AuditStore>) -> Harness {
    let documents = InMemoryDocumentExecutor::new().with_collection(
        "clients",
        vec![
            json!({"_id": "c1", "name": "Acme", "status": "active", "password": "x", "__v": 1}),
            json!({"_id": "c2", "name": "Globex", "status": "inactive", "contact": {"apiKey": "k", "email": "g@x.test"}}),
        ],
    );
    let registry = builtin_registry(Arc::new(documents))
        .with(Arc::new(VaultRotate))
        .with(Arc::new(FlakyCrm));
    let actors = Arc::new(InMemoryActorStore::new([
        Actor::new("root", Role::Admin),
        Actor::new("clerk", Role::Staff),
        Actor::new("walk-in", Role::Guest),
        Actor::new("keeper", Role::Guest).with_permissions(["ai:vault.*"]),
    ]));
    let tools = Arc::new(InMemoryToolStore::new(registry.descriptors()));
    let kernel = GovernanceKernel::from_config(
        &GovernanceConfig::default(),
        Collaborators {
            actors,
            tools: tools.clone(),
            registry,
            audit: store,
        },
    );
    Harness {
        kernel,
        audit,
        tools,
    }
}

#[tokio::test]
async fn allowed_call_is_sanitized_and_audited() {
    let h = harness();
    let outcome = h
        .kernel
        .execute(
            ToolRequest::new("clerk", "db.query", json!({"collection": "clients"}))
                .with_session("chat-7")
                .with_request_id("req-1"),
        )
        .await;
    assert_eq!(outcome.request_id, "req-1");
    assert!(outcome.audited);
    let ExecutionResult::Completed { data } = &outcome.result else {
        panic!("expected completion, got {:?}", outcome.result);
    };
    assert_eq!(data["count"], json!(2));
    let text = data.to_string();
    assert!(!text.contains("password"));
    assert!(!text.contains("apiKey"));
    assert!(!text.contains("__v"));
    assert_eq!(data["documents"][1]["contact"]["email"], json!("g@x.test"));

    let record = h.audit.find_by_request_id("req-1").await.unwrap().unwrap();
    assert!(record.success);
    assert_eq!(record.session_id.as_deref(), Some("chat-7"));
    assert_eq!(record.params, json!({"collection": "clients", "limit": 10}));
    assert!(record.reason_code.is_none());
}

#[tokio::test]
async fn denial_is_terminal_and_audited() {
    let h = harness();
    let outcome = h
        .kernel
        .execute(ToolRequest::new("walk-in", "crm.search_clients", json!({})))
        .await;
    assert!(outcome.audited);
    match &outcome.result {
        ExecutionResult::Denied {
            reason_code,
            message,
        } => {
            assert_eq!(*reason_code, ReasonCode::PermissionDenied);
            assert!(message.contains("ai:crm.read"));
        }
        other => panic!("expected denial, got {other:?}"),
    }
    let record = h
        .audit
        .find_by_request_id(&outcome.request_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!record.success);
    assert_eq!(record.reason_code.as_deref(), Some("PERMISSION_DENIED"));

    let ghost = h
        .kernel
        .execute(ToolRequest::new("ghost", "db.query", json!({"collection": "clients"})))
        .await;
    assert_eq!(
        ghost.result.reason(),
        Some(ReasonCode::ActorNotFound.as_str())
    );
}

#[tokio::test]
async fn validation_failures_never_reach_the_tool() {
    let h = harness();
    let missing = h
        .kernel
        .execute(ToolRequest::new("root", "db.query", json!({"limit": 5})))
        .await;
    assert_eq!(missing.result.reason(), Some("MISSING_REQUIRED_PARAM"));

    let dangerous = h
        .kernel
        .execute(ToolRequest::new(
            "root",
            "db.query",
            json!({"collection": "clients", "query": {"$or": [{"$where": "1"}]}}),
        ))
        .await;
    assert_eq!(dangerous.result.reason(), Some("DANGEROUS_OPERATOR"));

    let bad_enum = h
        .kernel
        .execute(ToolRequest::new(
            "root",
            "crm.search_clients",
            json!({"status": "archived"}),
        ))
        .await;
    assert_eq!(bad_enum.result.reason(), Some("INVALID_ENUM_VALUE"));

    let stats = h
        .kernel
        .recorder()
        .get_stats(&StatsWindow::default())
        .await
        .unwrap();
    assert_eq!(stats.total_calls, 3);
    assert_eq!(stats.success_calls, 0);
    assert_eq!(stats.success_rate, 0.0);
}

#[tokio::test]
async fn tool_errors_pass_through() {
    let h = harness();
    let outcome = h
        .kernel
        .execute(ToolRequest::new("root", "crm.search_clients", json!({"status": "active"})))
        .await;
    assert_eq!(
        outcome.result,
        ExecutionResult::Failed {
            error: ToolError::new("UPSTREAM_DOWN", "crm backend unreachable")
        }
    );
    let record = h
        .audit
        .find_by_request_id(&outcome.request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.reason_code.as_deref(), Some("UPSTREAM_DOWN"));
    assert_eq!(record.error_message.as_deref(), Some("crm backend unreachable"));

    let unknown = h
        .kernel
        .execute(ToolRequest::new("root", "report.generate", json!({})))
        .await;
    let ExecutionResult::Failed { error } = unknown.result else {
        panic!("expected failure");
    };
    assert_eq!(error.code, TOOL_NOT_FOUND);
    assert!(unknown.audited);
}

#[tokio::test]
async fn credential_bearing_params_are_digested() {
    let h = harness();
    let outcome = h
        .kernel
        .execute(ToolRequest::new(
            "keeper",
            "vault.rotate",
            json!({"path": "kv/prod/db", "note": "quarterly"}),
        ))
        .await;
    let ExecutionResult::Completed { data } = &outcome.result else {
        panic!("expected completion, got {:?}", outcome.result);
    };
    assert_eq!(data, &json!({"path": "kv/prod/db", "rotated": true}));

    let record = h
        .audit
        .find_by_request_id(&outcome.request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.params["redacted"], json!(true));
    assert!(!record.params.to_string().contains("kv/prod/db"));

    // denied attempts against the same tool keep only the digest as well
    let denied = h
        .kernel
        .execute(ToolRequest::new("clerk", "vault.rotate", json!({"path": "kv/prod/db"})))
        .await;
    assert_eq!(denied.result.reason(), Some("PERMISSION_DENIED"));
    let record = h
        .audit
        .find_by_request_id(&denied.request_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!record.params.to_string().contains("kv/prod/db"));
}

#[tokio::test]
async fn credential_flag_follows_the_validated_descriptor() {
    let h = harness();
    let rejected = h
        .kernel
        .execute(ToolRequest::new("keeper", "vault.rotate", json!({"note": "s3cr3t-token"})))
        .await;
    assert_eq!(rejected.result.reason(), Some("MISSING_REQUIRED_PARAM"));
    let record = h
        .audit
        .find_by_request_id(&rejected.request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.params["redacted"], json!(true));
    assert!(!record.params.to_string().contains("s3cr3t-token"));

    let plain = h
        .kernel
        .execute(ToolRequest::new("clerk", "db.query", json!({"collection": "clients"})))
        .await;
    let record = h
        .audit
        .find_by_request_id(&plain.request_id)
        .await
        .unwrap()
        .unwrap();
    assert!(record.params.get("redacted").is_none());
    assert_eq!(record.params["limit"], json!(10));
}

#[tokio::test]
async fn descriptor_outage_denies_with_internal_error() {
    let h = harness();
    // warm the requirement cache so authorization succeeds without the store
    let first = h
        .kernel
        .execute(ToolRequest::new("keeper", "vault.rotate", json!({"path": "a"})))
        .await;
    assert!(first.result.is_success());

    h.tools.set_unavailable(true);
    let outcome = h
        .kernel
        .execute(ToolRequest::new("keeper", "vault.rotate", json!({"path": "a"})))
        .await;
    assert_eq!(outcome.result.reason(), Some("INTERNAL_CHECK_ERROR"));
    assert!(outcome.audited);
}

struct RefusingStore;

#[async_trait]
impl AuditStore for RefusingStore {
    async fn insert(&self, _record: &AuditRecord) -> Result<(), AuditError> {
        Err(AuditError::Io("read-only filesystem".into()))
    }
    async fn find_by_request_id(&self, _id: &str) -> Result<Option<AuditRecord>, AuditError> {
        Ok(None)
    }
    async fn find_by_actor(
        &self,
        _actor_id: &str,
        _filter: &AuditFilter,
        page: PageRequest,
    ) -> Result<AuditPage, AuditError> {
        Ok(AuditPage {
            records: Vec::new(),
            total: 0,
            page: page.page,
            limit: page.limit,
        })
    }
    async fn counts(&self, _window: &StatsWindow) -> Result<(u64, u64), AuditError> {
        Ok((0, 0))
    }
}

#[tokio::test]
async fn audit_failure_does_not_reverse_execution() {
    let h = harness_with_audit(Arc::new(MemoryAuditStore::new()), Arc::new(RefusingStore));
    let outcome = h
        .kernel
        .execute(ToolRequest::new("clerk", "db.count", json!({"collection": "clients"})))
        .await;
    assert!(!outcome.audited);
    assert_eq!(
        outcome.result,
        ExecutionResult::Completed {
            data: json!({"collection": "clients", "count": 2})
        }
    );
}

#[tokio::test]
async fn actor_history_through_the_kernel() {
    let h = harness();
    for i in 0..3 {
        h.kernel
            .execute(
                ToolRequest::new("clerk", "db.count", json!({"collection": "clients"}))
                    .with_request_id(format!("n{i}")),
            )
            .await;
    }
    h.kernel
        .execute(ToolRequest::new("clerk", "finance.get_service_pricing", json!({})))
        .await;

    let page = h
        .kernel
        .recorder()
        .get_by_actor("clerk", &AuditFilter::default(), PageRequest::new(1, 2))
        .await
        .unwrap();
    assert_eq!(page.total, 4);
    assert_eq!(page.records.len(), 2);
    assert_eq!(page.records[0].tool_id, "finance.get_service_pricing");
    assert_eq!(page.records[1].request_id, "n2");

    let stats = h
        .kernel
        .recorder()
        .get_stats(&StatsWindow::default())
        .await
        .unwrap();
    assert_eq!(stats.success_rate, 75.0);

    let (actor_cache, tool_cache) = h.kernel.cache_stats();
    assert_eq!(actor_cache.misses, 1);
    // tool check plus the in-tool collection check on every db.count call
    assert_eq!(actor_cache.hits, 6);
    assert_eq!(tool_cache.misses, 2);
}

#[tokio::test]
async fn fixtures_wire_a_jsonl_backed_kernel() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("audit.jsonl");
    let config = GovernanceConfig::from_yaml(&format!(
        "audit:\n  backend: jsonl\n  path: {}\n",
        log.display()
    ))
    .unwrap();
    let fixtures: Fixtures = serde_yaml::from_str(
        r#"
actors:
  - id: ana
    role: manager
  - id: bo
    permissions: ["ai:db.query"]
    role: intern
tools:
  - tool_id: db.count
    required_permission: ai:db.count
collections:
  orders:
    - {_id: 1, total: 10, secret: s}
    - {_id: 2, total: 30}
"#,
    )
    .unwrap();
    let kernel = GovernanceKernel::from_config(&config, fixtures.into_collaborators(&config).unwrap());

    let ok = kernel
        .execute(ToolRequest::new("ana", "db.query", json!({"collection": "orders", "sort": {"total": -1}})))
        .await;
    let ExecutionResult::Completed { data } = &ok.result else {
        panic!("expected completion, got {:?}", ok.result);
    };
    assert_eq!(data["documents"][0]["total"], json!(30));
    assert!(data["documents"][1].get("secret").is_none());

    // fixture descriptor overrides the built-in one
    let denied = kernel
        .execute(ToolRequest::new("bo", "db.count", json!({"collection": "orders"})))
        .await;
    assert_eq!(denied.result.reason(), Some("PERMISSION_DENIED"));

    assert_eq!(atlas_receipts::verify_log(&log).unwrap(), 2);
}
