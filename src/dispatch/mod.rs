//! Tool dispatch pipeline (C6): the ten-step gate that every inbound
//! call passes through before it reaches the editor or a local tool.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::audit::{canonical_json, AuditSigner};
use crate::dedup::DedupStore;
use crate::error::{DispatchError, PolicyError};
use crate::policy::PolicyEngine;
use crate::session::SessionManager;

/// A tool executed in-process rather than forwarded to the editor (C7
/// wrappers plug in here). The specific wrappers named out of scope
/// (build/cook/run, gauntlet, automation specs) are not implemented;
/// `sc.status` below is the one illustrative example wired up.
#[async_trait]
pub trait LocalTool: Send + Sync {
    async fn call(&self, params: Value) -> Result<Value, DispatchError>;
}

pub struct StatusTool;

#[async_trait]
impl LocalTool for StatusTool {
    async fn call(&self, _params: Value) -> Result<Value, DispatchError> {
        Ok(json!({"ok": true, "result": {"status": "ready"}}))
    }
}

pub struct DispatchRequest {
    pub tool: String,
    pub params: Value,
    pub request_id: String,
    pub role: String,
    pub dry_run: bool,
}

pub struct Dispatcher {
    pub policy: PolicyEngine,
    pub dedup: DedupStore,
    pub audit: Option<AuditSigner>,
    pub session: Arc<SessionManager>,
    pub local_tools: HashMap<String, Arc<dyn LocalTool>>,
    pub allow_write: bool,
    pub audit_journal_path: Option<PathBuf>,
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{b:02x}").unwrap();
    }
    out
}

fn error_response(code: &str, message: impl Into<String>, details: Option<Value>) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message.into(),
            "details": details.unwrap_or(Value::Null),
        }
    })
}

impl Dispatcher {
    pub async fn dispatch(&self, req: DispatchRequest) -> Value {
        // Step 1: shape check.
        if !req.params.is_object() {
            return error_response("INVALID_PARAMS", "params must be an object", None);
        }

        // Step 2: policy refresh + role evaluation.
        if let Err(e) = self.policy.refresh() {
            tracing::warn!(error = %e, "policy refresh failed, using last-known-good document");
        }
        if !self.policy.is_tool_allowed(&req.role, &req.tool) {
            let e = PolicyError::ToolDenied {
                role: req.role.clone(),
                tool: req.tool.clone(),
            };
            return error_response(e.code(), e.to_string(), None);
        }

        // Step 3: rate limit.
        let decision = self.policy.check_rate(&req.tool);
        if !decision.allowed {
            return error_response(
                "RATE_LIMITED",
                "rate limit exceeded",
                Some(json!({"retryAfterSec": decision.retry_after_sec})),
            );
        }

        // Step 4: size + array limits.
        if let Err(e) = self.policy.check_size(&req.params) {
            return error_response(e.code(), e.to_string(), None);
        }

        // Step 5: schema validation.
        if let Err(msg) = self.policy.schema.validate(&req.tool, &req.params) {
            return error_response("INVALID_PARAMS", msg, None);
        }

        // Step 6: path sandbox.
        let sandbox = self.policy.sandbox();
        if let Some(bad_path) = sandbox.check_params(&req.params) {
            return error_response("PATH_NOT_ALLOWED", format!("path not allowed: {bad_path}"), None);
        }

        // Step 7: dedup lookup.
        if let Some(cached) = self.dedup.get(&req.request_id) {
            return cached;
        }

        let is_mutation = crate::session::is_mutation_tool(&req.tool);

        // Step 8: execute.
        let mut response = if let Some(local) = self.local_tools.get(&req.tool) {
            match local.call(req.params.clone()).await {
                Ok(v) => v,
                Err(e) => error_response(e.code(), e.to_string(), None),
            }
        } else if is_mutation && !self.allow_write && req.tool != "sc.status" {
            self.record_blocked_mutation_audit(&req);
            return error_response(
                "WRITE_NOT_ALLOWED",
                "mutation blocked: allow_write is false",
                None,
            );
        } else {
            match self.session.send_command(&req.tool, req.params.clone()).await {
                Ok(v) => v,
                Err(e) => error_response(e.code(), e.to_string(), None),
            }
        };

        let succeeded = response.get("ok").and_then(Value::as_bool).unwrap_or(false);

        // Step 9: attach audit signature for successful mutations.
        if is_mutation && succeeded {
            if let Some(signer) = &self.audit {
                let executed = response
                    .get("audit")
                    .and_then(|a| a.get("executed"))
                    .and_then(Value::as_bool)
                    .unwrap_or(!req.dry_run);
                let dry_run = response
                    .get("audit")
                    .and_then(|a| a.get("dryRun"))
                    .and_then(Value::as_bool)
                    .unwrap_or(req.dry_run);
                let sig = signer.sign(
                    &req.request_id,
                    &req.tool,
                    &json!({"executed": executed, "dryRun": dry_run}),
                );
                if let Value::Object(ref mut map) = response {
                    map.insert("security".to_string(), serde_json::to_value(&sig).unwrap());
                }
            }
        }

        // Step 10: store + audit journal.
        self.dedup.put(&req.request_id, &response);
        if is_mutation {
            self.append_audit_line(&req, succeeded, !req.dry_run);
        }

        response
    }

    fn record_blocked_mutation_audit(&self, req: &DispatchRequest) {
        self.append_audit_line_with(&req.tool, &req.params, false, false);
    }

    fn append_audit_line(&self, req: &DispatchRequest, ok: bool, executed: bool) {
        self.append_audit_line_with(&req.tool, &req.params, ok, executed);
    }

    fn append_audit_line_with(&self, tool: &str, params: &Value, ok: bool, executed: bool) {
        let digest = Sha256::digest(canonical_json(params).as_bytes());
        let params_digest = hex_encode(&digest)[..12].to_string();
        let line = json!({
            "ts": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "tool": tool,
            "mutation": true,
            "dryRun": !executed,
            "executed": executed,
            "paramsDigest": params_digest,
            "ok": ok,
        });
        self.write_audit_line(&line);
    }

    fn write_audit_line(&self, line: &Value) {
        use std::io::Write;
        let Some(path) = self.audit_journal_path.as_ref() else {
            return;
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        if let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
            if let Ok(serialized) = serde_json::to_string(line) {
                let _ = writeln!(f, "{serialized}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditSigner;
    use crate::dedup::DedupStore;
    use crate::policy::PolicyEngine;
    use crate::session::SessionManager;
    use std::time::Duration;

    fn test_dispatcher(
        allow_write: bool,
        audit_journal_path: Option<PathBuf>,
    ) -> (Dispatcher, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let policy_path = dir.path().join("policy.yaml");
        std::fs::write(
            &policy_path,
            r#"
roles:
  dev:
    allow: ["*"]
"#,
        )
        .unwrap();

        let mut local_tools: HashMap<String, Arc<dyn LocalTool>> = HashMap::new();
        local_tools.insert("sc.status".to_string(), Arc::new(StatusTool));

        let dispatcher = Dispatcher {
            policy: PolicyEngine::load(policy_path).unwrap(),
            dedup: DedupStore::in_memory(Duration::from_secs(600), 2048),
            audit: Some(AuditSigner::new("secret").unwrap()),
            session: Arc::new(SessionManager::new(
                "127.0.0.1:1".to_string(),
                "5.4".to_string(),
                "1.0".to_string(),
                allow_write,
            )),
            local_tools,
            allow_write,
            audit_journal_path,
        };
        (dispatcher, dir)
    }

    #[tokio::test]
    async fn local_tool_bypasses_session_entirely() {
        let (d, _dir) = test_dispatcher(false, None);
        let resp = d
            .dispatch(DispatchRequest {
                tool: "sc.status".to_string(),
                params: json!({}),
                request_id: "r1".to_string(),
                role: "dev".to_string(),
                dry_run: true,
            })
            .await;
        assert_eq!(resp["ok"], true);
    }

    #[tokio::test]
    async fn dedup_hit_returns_stored_response_without_recompute() {
        let (d, _dir) = test_dispatcher(false, None);
        let first = d
            .dispatch(DispatchRequest {
                tool: "sc.status".to_string(),
                params: json!({}),
                request_id: "dup".to_string(),
                role: "dev".to_string(),
                dry_run: true,
            })
            .await;
        let second = d
            .dispatch(DispatchRequest {
                tool: "sc.status".to_string(),
                params: json!({}),
                request_id: "dup".to_string(),
                role: "dev".to_string(),
                dry_run: true,
            })
            .await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn mutation_blocked_when_write_not_allowed() {
        let (d, _dir) = test_dispatcher(false, None);
        let resp = d
            .dispatch(DispatchRequest {
                tool: "spawn_actor".to_string(),
                params: json!({"classPath": "X", "location": {"x": 0, "y": 0, "z": 0}}),
                request_id: "r2".to_string(),
                role: "dev".to_string(),
                dry_run: true,
            })
            .await;
        assert_eq!(resp["error"]["code"], "WRITE_NOT_ALLOWED");
    }

    #[tokio::test]
    async fn invalid_params_shape_is_rejected() {
        let (d, _dir) = test_dispatcher(false, None);
        let resp = d
            .dispatch(DispatchRequest {
                tool: "sc.status".to_string(),
                params: json!("not an object"),
                request_id: "r3".to_string(),
                role: "dev".to_string(),
                dry_run: true,
            })
            .await;
        assert_eq!(resp["error"]["code"], "INVALID_PARAMS");
    }

    #[tokio::test]
    async fn unknown_role_is_denied() {
        let (d, _dir) = test_dispatcher(false, None);
        let resp = d
            .dispatch(DispatchRequest {
                tool: "sc.status".to_string(),
                params: json!({}),
                request_id: "r4".to_string(),
                role: "guest".to_string(),
                dry_run: true,
            })
            .await;
        assert_eq!(resp["error"]["code"], "TOOL_DENIED");
    }

    #[tokio::test]
    async fn blocked_mutation_appends_one_audit_line() {
        let dir = tempfile::tempdir().unwrap();
        let journal = dir.path().join("audit.jsonl");
        let (d, _policy_dir) = test_dispatcher(false, Some(journal.clone()));
        let _resp = d
            .dispatch(DispatchRequest {
                tool: "spawn_actor".to_string(),
                params: json!({"classPath": "X", "location": {"x": 0, "y": 0, "z": 0}}),
                request_id: "r5".to_string(),
                role: "dev".to_string(),
                dry_run: true,
            })
            .await;
        let contents = std::fs::read_to_string(&journal).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        let parsed: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["executed"], false);
        assert_eq!(parsed["dryRun"], true);
        let digest = parsed["paramsDigest"].as_str().expect("paramsDigest present");
        assert_eq!(digest.len(), 12);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hex_encode_matches_known_digest() {
        let digest = Sha256::digest(b"");
        assert_eq!(&hex_encode(&digest)[..12], "e3b0c44298fc");
    }
}
