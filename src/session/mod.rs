//! Upstream session manager (C5): owns the single TCP connection to the
//! embedded editor plugin. One task owns the socket; callers reach it
//! through a command channel, which is itself the single-in-flight
//! serialization point — no mutex is held across socket I/O.

use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::error::SessionError;
use crate::protocol::{read_frame, write_frame};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const PROTOCOL_VERSION: u32 = 1;

/// Tools that mutate editor state. `sc.status` is deliberately excluded
/// even though it matches no destructive naming pattern.
static MUTATION_TOOLS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "spawn_actor",
        "compile_blueprint",
        "asset.batch_import",
        "sequence.create",
    ]
    .into_iter()
    .collect()
});

pub fn is_mutation_tool(tool: &str) -> bool {
    MUTATION_TOOLS.contains(tool)
}

struct SessionCommand {
    name: String,
    params: Value,
    reply: oneshot::Sender<Result<Value, SessionError>>,
}

#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
    allow_write: bool,
}

/// Returned by `send_command` when the mutation gate short-circuits the call
/// without contacting the editor. Dispatch uses this to emit a synthetic
/// audit entry instead of one derived from an editor response.
#[derive(Debug)]
pub struct WriteNotAllowed;

impl SessionHandle {
    pub async fn send_command(&self, name: &str, params: Value) -> Result<Value, SessionError> {
        if is_mutation_tool(name) && name != "sc.status" && !self.allow_write {
            return Err(SessionError::WriteNotAllowed);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SessionCommand {
                name: name.to_string(),
                params,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SessionError::ConnectionClosed)?;

        reply_rx.await.map_err(|_| SessionError::ConnectionClosed)?
    }
}

/// Connects, performs the handshake, and spawns the task that owns the
/// socket for the rest of the session's life. Returns a cheaply-clonable
/// handle; the background task exits when the handle (and all its clones)
/// are dropped.
pub async fn connect(
    addr: &str,
    engine_version: &str,
    plugin_version: &str,
    allow_write: bool,
) -> Result<SessionHandle, SessionError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| SessionError::Transport(e.to_string()))?;
    stream.set_nodelay(true).ok();

    let session_id = uuid::Uuid::new_v4().to_string();
    let handshake = json!({
        "type": "handshake",
        "protocolVersion": PROTOCOL_VERSION,
        "engineVersion": engine_version,
        "pluginVersion": plugin_version,
        "sessionId": session_id,
    });
    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    write_frame(&mut stream, &handshake, Some(deadline))
        .await
        .map_err(|e| SessionError::HandshakeFailed(e.to_string()))?;
    let ack = read_frame(&mut stream, Some(deadline))
        .await
        .map_err(|e| SessionError::HandshakeFailed(e.to_string()))?;

    let ok = ack.get("type").and_then(Value::as_str) == Some("handshake/ack")
        && ack.get("ok").and_then(Value::as_bool) == Some(true);
    if !ok {
        return Err(SessionError::ProtocolVersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: ack
                .get("protocolVersion")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
        });
    }

    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(session_task(stream, rx));

    Ok(SessionHandle { tx, allow_write })
}

async fn session_task(mut stream: TcpStream, mut rx: mpsc::Receiver<SessionCommand>) {
    while let Some(cmd) = rx.recv().await {
        let result = run_command(&mut stream, &cmd.name, cmd.params).await;
        let fatal = matches!(
            result,
            Err(SessionError::ConnectionClosed | SessionError::Transport(_))
        );
        let _ = cmd.reply.send(result);
        if fatal {
            break;
        }
    }
}

async fn run_command(
    stream: &mut TcpStream,
    name: &str,
    params: Value,
) -> Result<Value, SessionError> {
    let frame = json!({ "type": name, "params": params });
    write_frame(stream, &frame, Some(Instant::now() + IDLE_TIMEOUT))
        .await
        .map_err(SessionError::from)?;

    let deadline = Instant::now() + IDLE_TIMEOUT;
    loop {
        let frame = read_frame(stream, Some(deadline)).await.map_err(SessionError::from)?;
        match frame.get("type").and_then(Value::as_str) {
            Some("ping") => {
                let pong = json!({ "type": "pong", "ts": frame.get("ts").cloned().unwrap_or(Value::Null) });
                write_frame(stream, &pong, Some(deadline)).await.map_err(SessionError::from)?;
                continue;
            }
            Some("pong") => continue,
            _ => return Ok(frame),
        }
    }
}

/// Wraps `connect`/`SessionHandle` with a single reconnect-and-retry when a
/// command observes a transport-class failure, so callers above C6 don't
/// have to special-case "the editor dropped the TCP connection between calls."
pub struct SessionManager {
    addr: String,
    engine_version: String,
    plugin_version: String,
    allow_write: bool,
    current: tokio::sync::Mutex<Option<SessionHandle>>,
}

impl SessionManager {
    pub fn new(addr: String, engine_version: String, plugin_version: String, allow_write: bool) -> Self {
        SessionManager {
            addr,
            engine_version,
            plugin_version,
            allow_write,
            current: tokio::sync::Mutex::new(None),
        }
    }

    async fn ensure_connected<'a>(
        &self,
        guard: &mut tokio::sync::MutexGuard<'a, Option<SessionHandle>>,
    ) -> Result<SessionHandle, SessionError> {
        if let Some(handle) = guard.as_ref() {
            return Ok(handle.clone());
        }
        let handle = connect(&self.addr, &self.engine_version, &self.plugin_version, self.allow_write).await?;
        **guard = Some(handle.clone());
        Ok(handle)
    }

    pub async fn send_command(&self, name: &str, params: Value) -> Result<Value, SessionError> {
        let mut guard = self.current.lock().await;
        let handle = self.ensure_connected(&mut guard).await?;
        drop(guard);

        match handle.send_command(name, params.clone()).await {
            Ok(v) => Ok(v),
            Err(e) if is_transport_failure(&e) => {
                let mut guard = self.current.lock().await;
                *guard = None;
                let handle = self.ensure_connected(&mut guard).await?;
                drop(guard);
                handle.send_command(name, params).await
            }
            Err(e) => Err(e),
        }
    }
}

fn is_transport_failure(e: &SessionError) -> bool {
    matches!(
        e,
        SessionError::ConnectionClosed
            | SessionError::ReadTimeout
            | SessionError::WriteTimeout
            | SessionError::Transport(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn fake_editor(listener: TcpListener, respond_with: Value) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _handshake = read_frame(&mut stream, None).await.unwrap();
        write_frame(
            &mut stream,
            &json!({"type": "handshake/ack", "ok": true, "capabilities": []}),
            None,
        )
        .await
        .unwrap();
        let _cmd = read_frame(&mut stream, None).await.unwrap();
        write_frame(&mut stream, &respond_with, None).await.unwrap();
    }

    #[tokio::test]
    async fn handshake_then_command_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(fake_editor(listener, json!({"ok": true, "result": {"x": 1}})));

        let session = connect(&addr, "5.4", "1.0", true).await.unwrap();
        let resp = session.send_command("sc.status", json!({})).await.unwrap();
        assert_eq!(resp, json!({"ok": true, "result": {"x": 1}}));
    }

    #[tokio::test]
    async fn ping_is_consumed_inline_before_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _handshake = read_frame(&mut stream, None).await.unwrap();
            write_frame(
                &mut stream,
                &json!({"type": "handshake/ack", "ok": true, "capabilities": []}),
                None,
            )
            .await
            .unwrap();
            let _cmd = read_frame(&mut stream, None).await.unwrap();
            write_frame(&mut stream, &json!({"type": "ping", "ts": 42}), None)
                .await
                .unwrap();
            let pong = read_frame(&mut stream, None).await.unwrap();
            assert_eq!(pong["type"], "pong");
            assert_eq!(pong["ts"], 42);
            write_frame(&mut stream, &json!({"ok": true}), None).await.unwrap();
        });

        let session = connect(&addr, "5.4", "1.0", true).await.unwrap();
        let resp = session.send_command("sc.status", json!({})).await.unwrap();
        assert_eq!(resp, json!({"ok": true}));
    }

    #[tokio::test]
    async fn mutation_blocked_without_allow_write() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _handshake = read_frame(&mut stream, None).await.unwrap();
            write_frame(
                &mut stream,
                &json!({"type": "handshake/ack", "ok": true, "capabilities": []}),
                None,
            )
            .await
            .unwrap();
        });

        let session = connect(&addr, "5.4", "1.0", false).await.unwrap();
        let err = session.send_command("spawn_actor", json!({})).await.unwrap_err();
        assert!(matches!(err, SessionError::WriteNotAllowed));
    }

    #[tokio::test]
    async fn sc_status_bypasses_mutation_gate() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(fake_editor(listener, json!({"ok": true})));

        let session = connect(&addr, "5.4", "1.0", false).await.unwrap();
        let resp = session.send_command("sc.status", json!({})).await.unwrap();
        assert_eq!(resp, json!({"ok": true}));
    }

    #[tokio::test]
    async fn manager_reconnects_after_editor_drops_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            // First connection: handshake then immediately drop.
            let (mut stream, _) = listener.accept().await.unwrap();
            let _handshake = read_frame(&mut stream, None).await.unwrap();
            write_frame(
                &mut stream,
                &json!({"type": "handshake/ack", "ok": true, "capabilities": []}),
                None,
            )
            .await
            .unwrap();
            drop(stream);
            drop(listener);
        });

        let manager = SessionManager::new(addr.clone(), "5.4".into(), "1.0".into(), true);
        let err = manager.send_command("sc.status", json!({})).await.unwrap_err();
        assert!(is_transport_failure(&err));
    }

    #[tokio::test]
    async fn bad_handshake_ack_is_version_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _handshake = read_frame(&mut stream, None).await.unwrap();
            write_frame(&mut stream, &json!({"type": "handshake/ack", "ok": false}), None)
                .await
                .unwrap();
        });

        let err = connect(&addr, "5.4", "1.0", true).await.unwrap_err();
        assert!(matches!(err, SessionError::ProtocolVersionMismatch { .. }));
    }
}
