//! End-to-end tests of the runtime over in-process surfaces and backends
//!
//! Events enter through a fake surface, flow through the session lanes and
//! the agent loop, and replies are checked on the same surface.

use std::sync::Arc;
use std::time::Duration;

use pocketclaw::config::Config;
use pocketclaw::error::BackendError;
use pocketclaw::providers::fake::ScriptedBackend;
use pocketclaw::providers::RouterSettings;
use pocketclaw::session::{MemoryStore, Role};
use pocketclaw::tools::CapabilityCall;
use pocketclaw::transport::fake::FakeTransport;
use pocketclaw::{Runtime, TransportAdapter};
use serde_json::json;
use tempfile::TempDir;

mod common;

use common::router_over;

const WAIT: Duration = Duration::from_secs(5);

fn fast_reconnect_config() -> Config {
    let mut config = Config::default();
    config.transport.backoff_base_ms = 10;
    config.transport.backoff_ceiling_ms = 50;
    config.agent.shutdown_timeout_ms = 1_000;
    config
}

#[tokio::test]
async fn test_capability_turn_end_to_end() {
    let sandbox = TempDir::new().expect("Failed to create sandbox");
    std::fs::write(sandbox.path().join("todo.txt"), "call the plumber").unwrap();

    let mut config = fast_reconnect_config();
    config.tools.sandbox_root = Some(sandbox.path().to_path_buf());

    let backend = ScriptedBackend::replying("local", "You need to call the plumber.").then_invoke(
        vec![CapabilityCall::new("read_file", json!({"path": "todo.txt"}))],
        "",
    );
    let surface = Arc::new(FakeTransport::new("chat"));
    let runtime = Runtime::builder(config)
        .with_router(router_over(vec![backend], RouterSettings::default()))
        .with_durable_store(Arc::new(MemoryStore::new()))
        .with_transports(vec![Arc::clone(&surface) as Arc<dyn TransportAdapter>])
        .start()
        .expect("Failed to start runtime");

    surface.inject_text("sam", "what's on my list?");
    let sent = surface.wait_for_sent(1, WAIT).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].user_id, "sam");
    assert_eq!(sent[0].text, "You need to call the plumber.");

    let summaries = runtime.store().summaries().await;
    assert_eq!(summaries.len(), 1);
    let session = runtime.store().snapshot(&summaries[0].id).await.unwrap();
    let roles: Vec<Role> = session.messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::ToolResult, Role::Assistant]);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_fallback_backend_answers_when_primary_is_down() {
    let primary = ScriptedBackend::failing("primary", BackendError::Unavailable("503".into()));
    let secondary = ScriptedBackend::replying("secondary", "still here");
    let surface = Arc::new(FakeTransport::new("chat"));
    let runtime = Runtime::builder(fast_reconnect_config())
        .with_router(router_over(vec![primary, secondary], RouterSettings::default()))
        .with_durable_store(Arc::new(MemoryStore::new()))
        .with_transports(vec![Arc::clone(&surface) as Arc<dyn TransportAdapter>])
        .start()
        .expect("Failed to start runtime");

    surface.inject_text("sam", "hello");
    let sent = surface.wait_for_sent(1, WAIT).await;
    assert_eq!(sent[0].text, "still here");

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_total_backend_failure_sends_error_reply() {
    let only = ScriptedBackend::failing("only", BackendError::Permanent("invalid key".into()));
    let surface = Arc::new(FakeTransport::new("chat"));
    let runtime = Runtime::builder(fast_reconnect_config())
        .with_router(router_over(vec![only], RouterSettings::default()))
        .with_durable_store(Arc::new(MemoryStore::new()))
        .with_transports(vec![Arc::clone(&surface) as Arc<dyn TransportAdapter>])
        .start()
        .expect("Failed to start runtime");

    surface.inject_text("sam", "hello");
    let sent = surface.wait_for_sent(1, WAIT).await;
    assert_eq!(sent.len(), 1);
    assert!(!sent[0].text.contains("invalid key"));

    let summaries = runtime.store().summaries().await;
    let session = runtime.store().snapshot(&summaries[0].id).await.unwrap();
    assert!(session.messages.is_empty());

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_surfaces_are_isolated() {
    let healthy = Arc::new(FakeTransport::new("healthy"));
    let flaky = Arc::new(FakeTransport::new("flaky").with_connect_failures(3));
    let runtime = Runtime::builder(fast_reconnect_config())
        .with_router(router_over(
            vec![ScriptedBackend::new("echo")],
            RouterSettings::default(),
        ))
        .with_durable_store(Arc::new(MemoryStore::new()))
        .with_transports(vec![
            Arc::clone(&healthy) as Arc<dyn TransportAdapter>,
            Arc::clone(&flaky) as Arc<dyn TransportAdapter>,
        ])
        .start()
        .expect("Failed to start runtime");

    healthy.inject_text("a", "one");
    assert_eq!(healthy.wait_for_sent(1, WAIT).await[0].text, "one");

    flaky.inject_text("b", "two");
    let sent = flaky.wait_for_sent(1, WAIT).await;
    assert_eq!(sent[0].text, "two");
    assert!(flaky.connect_attempts() >= 4);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_two_users_keep_separate_histories() {
    let surface = Arc::new(FakeTransport::new("chat"));
    let runtime = Runtime::builder(fast_reconnect_config())
        .with_router(router_over(
            vec![ScriptedBackend::new("echo")],
            RouterSettings::default(),
        ))
        .with_durable_store(Arc::new(MemoryStore::new()))
        .with_transports(vec![Arc::clone(&surface) as Arc<dyn TransportAdapter>])
        .start()
        .expect("Failed to start runtime");

    for i in 0..3 {
        surface.inject_text("alice", &format!("alice {}", i));
        surface.inject_text("bob", &format!("bob {}", i));
    }
    let sent = surface.wait_for_sent(6, WAIT).await;
    assert_eq!(sent.len(), 6);

    for user in ["alice", "bob"] {
        let texts: Vec<String> = sent
            .iter()
            .filter(|reply| reply.user_id == user)
            .map(|reply| reply.text.clone())
            .collect();
        let expected: Vec<String> = (0..3).map(|i| format!("{} {}", user, i)).collect();
        assert_eq!(texts, expected);
    }

    runtime.shutdown().await;
    for summary in runtime.store().summaries().await {
        let session = runtime.store().snapshot(&summary.id).await.unwrap();
        assert_eq!(session.messages.len(), 6);
        assert!(session
            .messages
            .iter()
            .all(|m| m.user_id == summary.key.user_id));
    }
}
