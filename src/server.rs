//! Caller-facing TCP listener: one task per connection, each running the
//! §6.2 handshake then looping `tool/call` frames through the dispatcher.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};

use crate::audit::AuditSigner;
use crate::config::GatewayConfig;
use crate::dedup::DedupStore;
use crate::dispatch::{Dispatcher, DispatchRequest, LocalTool, StatusTool};
use crate::error::{ConfigError, Error, Result};
use crate::policy::PolicyEngine;
use crate::protocol::{read_frame, write_frame};
use crate::session::SessionManager;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the shared `Dispatcher` from config: loads the policy document,
/// opens the dedup journal, wires up the audit signer (if a secret is
/// configured) and the upstream session manager.
pub fn build_dispatcher(config: &GatewayConfig) -> Result<Dispatcher> {
    let policy = PolicyEngine::load(config.policy_path.clone())?
        .with_extra_allowed_paths(config.allowed_paths.clone());

    let dedup = DedupStore::open(
        &config.dedup_journal_path,
        Duration::from_secs(config.dedup_ttl_secs),
        config.dedup_max_entries,
    )?;

    let secret_env = policy.audit_secret_env().unwrap_or_else(|| config.audit_secret_env.clone());
    let audit = match std::env::var(&secret_env) {
        Ok(secret) if !secret.is_empty() => Some(AuditSigner::new(&secret)?),
        _ => {
            tracing::warn!(env = %secret_env, "no audit secret configured, mutation responses will not be signed");
            None
        }
    };

    let session = Arc::new(SessionManager::new(
        config.upstream_addr.clone(),
        config.engine_version.clone(),
        config.plugin_version.clone(),
        config.allow_write,
    ));

    let mut local_tools: HashMap<String, Arc<dyn LocalTool>> = HashMap::new();
    local_tools.insert("sc.status".to_string(), Arc::new(StatusTool));

    Ok(Dispatcher {
        policy,
        dedup,
        audit,
        session,
        local_tools,
        allow_write: config.allow_write,
        audit_journal_path: Some(config.audit_journal_path.clone()),
    })
}

pub async fn serve(config: GatewayConfig) -> Result<()> {
    let dispatcher = Arc::new(build_dispatcher(&config)?);
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|e| Error::Config(ConfigError::Io(e)))?;
    tracing::info!(addr = %config.bind_addr, "gateway listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let dispatcher = dispatcher.clone();
        let dry_run_default = config.dry_run;
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, dispatcher, dry_run_default).await {
                tracing::info!(peer = %peer, error = %e, "caller connection closed");
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    dispatcher: Arc<Dispatcher>,
    dry_run_default: bool,
) -> Result<()> {
    stream.set_nodelay(true).ok();

    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    let handshake = read_frame(&mut stream, Some(deadline)).await?;
    if handshake.get("type").and_then(Value::as_str) != Some("handshake") {
        write_frame(
            &mut stream,
            &json!({"type": "handshake/ack", "ok": false}),
            Some(deadline),
        )
        .await?;
        return Ok(());
    }
    write_frame(&mut stream, &json!({"type": "handshake/ack", "ok": true}), Some(deadline)).await?;

    loop {
        let frame = match read_frame(&mut stream, None).await {
            Ok(f) => f,
            Err(_) => return Ok(()),
        };
        if frame.get("type").and_then(Value::as_str) != Some("tool/call") {
            continue;
        }

        let tool = frame.get("tool").and_then(Value::as_str).unwrap_or_default().to_string();
        let params = frame.get("params").cloned().unwrap_or(json!({}));
        let request_id = frame
            .get("requestId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let meta = frame.get("meta").cloned().unwrap_or(json!({}));
        let role = meta.get("role").and_then(Value::as_str).unwrap_or("dev").to_string();
        let dry_run = meta.get("dryRun").and_then(Value::as_bool).unwrap_or(dry_run_default);

        let response = dispatcher
            .dispatch(DispatchRequest {
                tool,
                params,
                request_id,
                role,
                dry_run,
            })
            .await;

        write_frame(&mut stream, &response, None).await?;
    }
}
