use std::sync::Arc;
use std::time::Duration;

use atlas_policy::{CollectionOp, PermissionResolver, PolicyDecision, PolicySettings, ResolverCaches};
use atlas_store::{InMemoryActorStore, InMemoryToolStore};
use atlas_types::{Actor, ReasonCode, Role, ToolDescriptor};

struct Fixture {
    actors: Arc<InMemoryActorStore>,
    tools: Arc<InMemoryToolStore>,
    resolver: PermissionResolver,
}

fn fixture_with(actors: Vec<Actor>, tools: Vec<ToolDescriptor>, settings: PolicySettings) -> Fixture {
    let actors = Arc::new(InMemoryActorStore::new(actors));
    let tools = Arc::new(InMemoryToolStore::new(tools));
    let resolver = PermissionResolver::new(
        actors.clone(),
        tools.clone(),
        ResolverCaches::new(64, 64),
        settings,
    );
    Fixture {
        actors,
        tools,
        resolver,
    }
}

fn fixture() -> Fixture {
    fixture_with(
        vec![
            Actor::new("root", Role::Admin),
            Actor::new("star", Role::Guest).with_permissions(["*"]),
            Actor::new("nobody", Role::Guest),
            Actor::new("dba", Role::Guest).with_permissions(["ai:db.*"]),
            Actor::new("pm", Role::Guest).with_permissions(["ai:project.*"]),
            Actor::new("clerk", Role::Staff),
            Actor::new("lead", Role::Manager),
        ],
        vec![
            ToolDescriptor::new("report.run").requires("ai:db.query"),
            ToolDescriptor::new("crm.ping").category("crm").open(),
            ToolDescriptor::new("crm.export_clients").category("crm"),
        ],
        PolicySettings::default(),
    )
}

#[tokio::test]
async fn super_tokens_allow_every_tool() {
    let f = fixture();
    for actor in ["root", "star"] {
        for tool in ["report.run", "db.delete", "never.registered"] {
            let decision = f.resolver.check_tool_permission(actor, tool).await;
            assert_eq!(decision, PolicyDecision::Allow, "{actor} -> {tool}");
        }
    }
}

#[tokio::test]
async fn default_allow_tools_need_no_grants() {
    let f = fixture();
    for tool in ["db.query", "schema.search"] {
        assert!(f.resolver.check_tool_permission("nobody", tool).await.is_allowed());
    }
    // not on the list, and db.count maps to ai:db.query
    let denied = f.resolver.check_tool_permission("nobody", "db.count").await;
    assert_eq!(denied.reason(), Some(ReasonCode::PermissionDenied));
}

#[tokio::test]
async fn wildcard_covers_top_level_segment_only() {
    let f = fixture();
    assert!(f.resolver.check_tool_permission("dba", "report.run").await.is_allowed());

    let decision = f.resolver.check_tool_permission("pm", "report.run").await;
    match decision {
        PolicyDecision::Deny { reason, message } => {
            assert_eq!(reason, ReasonCode::PermissionDenied);
            assert!(message.contains("ai:db.query"), "{message}");
        }
        PolicyDecision::Allow => panic!("ai:project.* must not cover ai:db.query"),
    }
}

#[tokio::test]
async fn unknown_actor_is_not_an_empty_permission_set() {
    let f = fixture();
    for tool in ["db.query", "report.run", "never.registered"] {
        let decision = f.resolver.check_tool_permission("ghost", tool).await;
        assert_eq!(decision.reason(), Some(ReasonCode::ActorNotFound));
    }
    let decision = f
        .resolver
        .check_collection_permission("ghost", "clients", CollectionOp::Read)
        .await;
    assert_eq!(decision.reason(), Some(ReasonCode::ActorNotFound));
}

#[tokio::test]
async fn repeated_checks_hit_the_cache() {
    let f = fixture();
    let first = f.resolver.check_tool_permission("dba", "report.run").await;
    let second = f.resolver.check_tool_permission("dba", "report.run").await;
    assert_eq!(first, second);
    assert_eq!(f.actors.reads(), 1);
    assert_eq!(f.tools.reads(), 1);
}

#[tokio::test]
async fn clearing_actor_cache_forces_a_reread() {
    let f = fixture();
    f.resolver.check_tool_permission("pm", "report.run").await;
    f.resolver.clear_actor_cache(Some("pm"));
    f.resolver.check_tool_permission("pm", "report.run").await;
    assert_eq!(f.actors.reads(), 2);

    f.resolver.clear_all();
    f.resolver.check_tool_permission("pm", "report.run").await;
    assert_eq!(f.actors.reads(), 3);
    assert_eq!(f.tools.reads(), 2);
}

#[tokio::test]
async fn grant_changes_show_up_only_after_invalidation() {
    let f = fixture();
    assert!(!f.resolver.check_tool_permission("pm", "report.run").await.is_allowed());

    f.actors
        .upsert(Actor::new("pm", Role::Guest).with_permissions(["ai:project.*", "ai:db.query"]))
        .await;
    // still served from cache
    assert!(!f.resolver.check_tool_permission("pm", "report.run").await.is_allowed());

    f.resolver.clear_actor_cache(None);
    assert!(f.resolver.check_tool_permission("pm", "report.run").await.is_allowed());
}

#[tokio::test]
async fn stale_entries_are_refetched() {
    let settings = PolicySettings {
        actor_ttl: Duration::ZERO,
        tool_ttl: Duration::ZERO,
        ..PolicySettings::default()
    };
    let f = fixture_with(
        vec![Actor::new("dba", Role::Guest).with_permissions(["ai:db.*"])],
        vec![ToolDescriptor::new("report.run").requires("ai:db.query")],
        settings,
    );
    f.resolver.check_tool_permission("dba", "report.run").await;
    f.resolver.check_tool_permission("dba", "report.run").await;
    assert_eq!(f.actors.reads(), 2);
    assert_eq!(f.tools.reads(), 2);
}

#[tokio::test]
async fn explicit_open_differs_from_unconfigured() {
    let f = fixture();
    assert!(f.resolver.check_tool_permission("nobody", "crm.ping").await.is_allowed());

    let denied = f.resolver.check_tool_permission("nobody", "crm.export_clients").await;
    match denied {
        PolicyDecision::Deny { message, .. } => assert!(message.contains("ai:crm.export_clients")),
        PolicyDecision::Allow => panic!("category default must apply"),
    }
    assert!(f.resolver.check_tool_permission("lead", "crm.export_clients").await.is_allowed());
    assert_eq!(
        f.resolver.tool_requirement("crm.ping").await.unwrap(),
        None
    );
}

#[tokio::test]
async fn tool_requirement_changes_need_invalidation() {
    let f = fixture();
    assert!(f.resolver.check_tool_permission("nobody", "crm.ping").await.is_allowed());
    f.tools
        .upsert(ToolDescriptor::new("crm.ping").requires("ai:crm.ping"))
        .await;
    assert!(f.resolver.check_tool_permission("nobody", "crm.ping").await.is_allowed());

    f.resolver.clear_tool_cache(Some("crm.ping"));
    assert!(!f.resolver.check_tool_permission("nobody", "crm.ping").await.is_allowed());
}

#[tokio::test]
async fn unknown_tools_without_requirement_are_allowed() {
    let f = fixture();
    assert!(f.resolver.check_tool_permission("nobody", "misc.unlisted").await.is_allowed());
}

#[tokio::test]
async fn store_failures_deny_with_internal_error() {
    let f = fixture();
    f.actors.set_unavailable(true);
    let decision = f.resolver.check_tool_permission("root", "db.query").await;
    assert_eq!(decision.reason(), Some(ReasonCode::InternalCheckError));

    f.actors.set_unavailable(false);
    f.tools.set_unavailable(true);
    let decision = f.resolver.check_tool_permission("dba", "report.run").await;
    assert_eq!(decision.reason(), Some(ReasonCode::InternalCheckError));
    // super-tokens never reach the tool store
    assert!(f.resolver.check_tool_permission("root", "report.run").await.is_allowed());
}

#[tokio::test]
async fn slow_store_times_out_into_denial() {
    let actors = Arc::new(
        InMemoryActorStore::new([Actor::new("root", Role::Admin)])
            .with_latency(Duration::from_millis(200)),
    );
    let tools = Arc::new(InMemoryToolStore::default());
    let resolver = PermissionResolver::new(
        actors,
        tools,
        ResolverCaches::new(8, 8),
        PolicySettings {
            store_timeout: Some(Duration::from_millis(10)),
            ..PolicySettings::default()
        },
    );
    let decision = resolver.check_tool_permission("root", "db.query").await;
    assert_eq!(decision.reason(), Some(ReasonCode::InternalCheckError));
}

#[tokio::test]
async fn collection_access_maps_read_and_write() {
    let f = fixture();
    let r = &f.resolver;
    assert!(r.check_collection_permission("clerk", "clients", CollectionOp::Read).await.is_allowed());
    assert_eq!(
        r.check_collection_permission("clerk", "clients", CollectionOp::Write)
            .await
            .reason(),
        Some(ReasonCode::PermissionDenied)
    );
    assert!(r.check_collection_permission("lead", "clients", CollectionOp::Write).await.is_allowed());
    assert!(!r.check_collection_permission("pm", "clients", CollectionOp::Read).await.is_allowed());

    // restricted collections stay closed unless a super-token is held
    assert!(!r.check_collection_permission("lead", "system.users", CollectionOp::Read).await.is_allowed());
    assert!(r.check_collection_permission("root", "system.users", CollectionOp::Read).await.is_allowed());
}
