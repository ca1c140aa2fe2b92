//! Exercises the dispatch pipeline against an in-process fake editor: a
//! bare TCP listener speaking the §6.1 handshake plus one scripted reply.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::net::TcpListener;

use uegw::audit::AuditSigner;
use uegw::dedup::DedupStore;
use uegw::dispatch::{Dispatcher, DispatchRequest, StatusTool};
use uegw::policy::PolicyEngine;
use uegw::session::SessionManager;

async fn fake_editor(listener: TcpListener, reply: serde_json::Value) {
    let (mut stream, _) = listener.accept().await.unwrap();
    let _handshake = uegw::protocol::read_frame(&mut stream, None).await.unwrap();
    uegw::protocol::write_frame(
        &mut stream,
        &json!({"type": "handshake/ack", "ok": true, "capabilities": []}),
        None,
    )
    .await
    .unwrap();
    let _cmd = uegw::protocol::read_frame(&mut stream, None).await.unwrap();
    uegw::protocol::write_frame(&mut stream, &reply, None).await.unwrap();
}

fn policy_yaml() -> &'static str {
    r#"
roles:
  dev:
    allow: ["*"]
limits:
  rate_per_minute_global: 120
  rate_per_minute_per_tool: 30
  request_size_kb: 256
  array_items_max: 1000
"#
}

async fn build_dispatcher(allow_write: bool, upstream_addr: String, dir: &tempfile::TempDir) -> Dispatcher {
    let policy_path = dir.path().join("policy.yaml");
    std::fs::write(&policy_path, policy_yaml()).unwrap();

    let mut local_tools: HashMap<String, Arc<dyn uegw::dispatch::LocalTool>> = HashMap::new();
    local_tools.insert("sc.status".to_string(), Arc::new(StatusTool));

    Dispatcher {
        policy: PolicyEngine::load(policy_path).unwrap(),
        dedup: DedupStore::in_memory(Duration::from_secs(600), 2048),
        audit: Some(AuditSigner::new("integration-secret").unwrap()),
        session: Arc::new(SessionManager::new(upstream_addr, "5.4".to_string(), "1.0".to_string(), allow_write)),
        local_tools,
        allow_write,
        audit_journal_path: Some(dir.path().join("audit.jsonl")),
    }
}

#[tokio::test]
async fn mutation_round_trip_produces_signed_response_and_audit_line() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(fake_editor(listener, json!({"ok": true, "result": {"spawned": true}})));

    let dir = tempfile::tempdir().unwrap();
    let dispatcher = build_dispatcher(true, addr, &dir).await;

    let resp = dispatcher
        .dispatch(DispatchRequest {
            tool: "spawn_actor".to_string(),
            params: json!({"classPath": "/Game/BP_Thing", "location": {"x": 0, "y": 0, "z": 0}}),
            request_id: "req-1".to_string(),
            role: "dev".to_string(),
            dry_run: false,
        })
        .await;

    assert_eq!(resp["ok"], true);
    assert!(resp.get("security").is_some(), "mutation response should carry an audit signature");

    let audit_path = dir.path().join("audit.jsonl");
    let contents = std::fs::read_to_string(audit_path).unwrap();
    assert_eq!(contents.lines().count(), 1);
    let line: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
    assert_eq!(line["tool"], "spawn_actor");
    assert_eq!(line["ok"], true);
}

#[tokio::test]
async fn unreachable_upstream_surfaces_transport_error_without_panicking() {
    let dir = tempfile::tempdir().unwrap();
    // Nothing listening on this port: connect should fail with a transport-class error.
    let dispatcher = build_dispatcher(true, "127.0.0.1:1".to_string(), &dir).await;

    let resp = dispatcher
        .dispatch(DispatchRequest {
            tool: "sequence.create".to_string(),
            params: json!({"name": "Seq01", "path": "/Game/Sequences/Seq01"}),
            request_id: "req-2".to_string(),
            role: "dev".to_string(),
            dry_run: true,
        })
        .await;

    assert_eq!(resp["ok"], false);
    assert!(resp["error"]["code"].is_string());
}

#[tokio::test]
async fn local_tool_call_never_touches_the_network() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = build_dispatcher(false, "127.0.0.1:1".to_string(), &dir).await;

    let resp = dispatcher
        .dispatch(DispatchRequest {
            tool: "sc.status".to_string(),
            params: json!({}),
            request_id: "req-3".to_string(),
            role: "dev".to_string(),
            dry_run: true,
        })
        .await;

    assert_eq!(resp["result"]["status"], "ready");
}
