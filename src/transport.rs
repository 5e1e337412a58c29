//! Process transport: owns one child process, frames JSON-RPC 2.0 messages
//! one-per-line over its stdio, and correlates responses to pending
//! requests by id (spec §4.1, §4.2).
//!
//! Unlike a transport that serializes an entire request/response cycle
//! behind one lock, this one only serializes the *write* of a line (so two
//! concurrent senders are strictly ordered on the wire — spec §5, "writer
//! ordering"). Reading is owned exclusively by a single background task
//! that looks up each incoming response by id and completes whichever
//! caller is waiting, in whatever order the server replies — MCP servers
//! are not required to answer in request order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::error::TransportError;
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};

/// Grace period before a child that ignores stdin EOF is killed forcibly.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type PendingMap = Mutex<HashMap<String, oneshot::Sender<Result<JsonRpcResponse, TransportError>>>>;

struct Connection {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    pending: Arc<PendingMap>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

/// A transport bound to one not-yet-spawned (or previously closed) child
/// process. `connect` spawns it; every other operation requires a prior
/// successful `connect`.
pub struct ProcessTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    timeout: Duration,
    conn: RwLock<Option<Arc<Connection>>>,
}

impl ProcessTransport {
    pub fn new(config: &ServerConfig, timeout: Duration) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            timeout,
            conn: RwLock::new(None),
        }
    }

    /// Spawn the child process and start the reader task. Rejects a second
    /// `connect` while the transport already holds a live connection.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let mut slot = self.conn.write().await;
        if slot.is_some() {
            return Err(TransportError::Spawn(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "transport is already connected",
            )));
        }

        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null());
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(TransportError::Spawn)?;
        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::Spawn(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdin",
            ))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::Spawn(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdout",
            ))
        })?;

        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let reader_task = tokio::spawn(read_loop(BufReader::new(stdout), pending.clone(), alive.clone()));

        *slot = Some(Arc::new(Connection {
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            pending,
            next_id: AtomicU64::new(1),
            alive,
            reader_task: Mutex::new(Some(reader_task)),
        }));
        Ok(())
    }

    /// Send a request and await its response, subject to the transport's
    /// configured timeout. Fails fast if not connected.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        let conn = self.active_connection().await?;

        let id = RequestId::from(conn.next_id.fetch_add(1, Ordering::Relaxed));
        let req = JsonRpcRequest::new(id.clone(), method, params);
        // `req` is built entirely from values we control (a String method and
        // a serde_json::Value); encoding it can't fail in practice.
        let line = serde_json::to_string(&req).expect("JsonRpcRequest always serializes");

        let (tx, rx) = oneshot::channel();
        conn.pending.lock().await.insert(id.0.clone(), tx);

        tracing::debug!(id = %id, method, "sending MCP request");
        if let Err(e) = write_line(&conn, &line).await {
            conn.pending.lock().await.remove(&id.0);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                conn.pending.lock().await.remove(&id.0);
                Err(TransportError::Timeout(self.timeout))
            }
        }
    }

    /// Send a notification; no response is expected or awaited.
    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), TransportError> {
        let conn = self.active_connection().await?;
        let notif = JsonRpcNotification::new(method, params);
        let line = serde_json::to_string(&notif).expect("JsonRpcNotification always serializes");
        tracing::debug!(method, "sending MCP notification");
        write_line(&conn, &line).await
    }

    /// True iff connected and the reader has not observed the child exit.
    pub async fn is_connected(&self) -> bool {
        match self.conn.read().await.as_ref() {
            Some(conn) => conn.alive.load(Ordering::SeqCst),
            None => false,
        }
    }

    /// Idempotent shutdown: fails every outstanding pending entry, closes
    /// stdin, waits briefly for the child to exit on its own, then kills it.
    pub async fn close(&self) {
        let conn = {
            let mut slot = self.conn.write().await;
            match slot.take() {
                Some(conn) => conn,
                None => return,
            }
        };

        conn.alive.store(false, Ordering::SeqCst);
        let mut pending = conn.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(TransportError::Closed));
        }
        drop(pending);

        {
            let mut stdin = conn.stdin.lock().await;
            if let Err(e) = stdin.shutdown().await {
                tracing::debug!(error = %e, "error closing MCP server stdin");
            }
        }

        let mut child = conn.child.lock().await;
        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(?status, "MCP server process exited"),
            Ok(Err(e)) => tracing::warn!(error = %e, "error waiting for MCP server process"),
            Err(_) => {
                tracing::warn!("MCP server did not exit within grace period, killing");
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill MCP server process");
                }
            }
        }
        drop(child);

        if let Some(handle) = conn.reader_task.lock().await.take() {
            let _ = handle.await;
        }
    }

    async fn active_connection(&self) -> Result<Arc<Connection>, TransportError> {
        let guard = self.conn.read().await;
        match guard.as_ref() {
            Some(conn) if conn.alive.load(Ordering::SeqCst) => Ok(conn.clone()),
            _ => Err(TransportError::NotConnected),
        }
    }
}

async fn write_line(conn: &Connection, line: &str) -> Result<(), TransportError> {
    let mut stdin = conn.stdin.lock().await;
    let result = async {
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }
    .await;

    if let Err(e) = result {
        conn.alive.store(false, Ordering::SeqCst);
        return Err(TransportError::Write(e));
    }
    Ok(())
}

/// Owns the stdout pipe exclusively; reads one line at a time, parses it,
/// and delivers it to whichever pending entry matches. Never panics on a
/// malformed line — it logs and moves on.
async fn read_loop(mut stdout: BufReader<ChildStdout>, pending: Arc<PendingMap>, alive: Arc<AtomicBool>) {
    loop {
        let mut line = String::new();
        let read = stdout.read_line(&mut line).await;

        let bytes_read = match read {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "MCP transport read error, marking connection errored");
                alive.store(false, Ordering::SeqCst);
                fail_all_pending(&pending, TransportError::Read(e)).await;
                return;
            }
        };

        if bytes_read == 0 {
            tracing::debug!("MCP server closed stdout (EOF)");
            alive.store(false, Ordering::SeqCst);
            fail_all_pending(
                &pending,
                TransportError::Read(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "child process closed stdout",
                )),
            )
            .await;
            return;
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            continue;
        }

        let resp: JsonRpcResponse = match serde_json::from_str(trimmed) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, line = %trimmed, "skipping malformed MCP message");
                continue;
            }
        };

        let mut guard = pending.lock().await;
        match guard.remove(&resp.id.0) {
            Some(tx) => {
                let _ = tx.send(Ok(resp));
            }
            None => {
                tracing::warn!(id = %resp.id, "discarding response for unknown or already-timed-out request");
            }
        }
    }
}

async fn fail_all_pending(pending: &PendingMap, make_err: TransportError) {
    let mut guard = pending.lock().await;
    for (_, tx) in guard.drain() {
        let _ = tx.send(Err(clone_transport_error(&make_err)));
    }
}

/// `TransportError` wraps `std::io::Error`, which isn't `Clone`; build an
/// equivalent failure for each pending waiter instead of cloning one.
fn clone_transport_error(e: &TransportError) -> TransportError {
    match e {
        TransportError::Read(io_err) => {
            TransportError::Read(std::io::Error::new(io_err.kind(), io_err.to_string()))
        }
        TransportError::Write(io_err) => {
            TransportError::Write(std::io::Error::new(io_err.kind(), io_err.to_string()))
        }
        TransportError::Spawn(io_err) => {
            TransportError::Spawn(std::io::Error::new(io_err.kind(), io_err.to_string()))
        }
        TransportError::Timeout(d) => TransportError::Timeout(*d),
        TransportError::NotConnected => TransportError::NotConnected,
        TransportError::Closed => TransportError::Closed,
        TransportError::Decode(_) => TransportError::Closed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn cfg(command: &str, args: &[&str]) -> ServerConfig {
        ServerConfig::new("test", command).with_args(args.iter().copied())
    }

    #[tokio::test]
    async fn connect_to_nonexistent_command_fails_with_spawn() {
        let t = ProcessTransport::new(&cfg("this-binary-does-not-exist-xyz", &[]), Duration::from_secs(1));
        let err = t.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::Spawn(_)));
    }

    #[tokio::test]
    async fn second_connect_while_live_is_rejected() {
        let t = ProcessTransport::new(&cfg("cat", &[]), Duration::from_secs(1));
        t.connect().await.unwrap();
        let err = t.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::Spawn(_)));
        t.close().await;
    }

    #[tokio::test]
    async fn send_request_before_connect_fails_not_connected() {
        let t = ProcessTransport::new(&cfg("cat", &[]), Duration::from_secs(1));
        let err = t.send_request("tools/list", None).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn request_times_out_against_unresponsive_child() {
        // `sleep` never writes to stdout.
        let t = ProcessTransport::new(&cfg("sleep", &["5"]), Duration::from_millis(150));
        t.connect().await.unwrap();
        let err = t.send_request("tools/list", None).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
        assert!(t.is_connected().await, "transport survives a single timeout");
        t.close().await;
    }

    #[tokio::test]
    async fn request_response_roundtrip_with_mock_echo() {
        // Reads one JSON-RPC line, extracts its id, and echoes a canned result.
        let script = r#"
            read line
            id=$(printf '%s' "$line" | sed -n 's/.*"id":"\{0,1\}\([0-9]*\)"\{0,1\}.*/\1/p')
            printf '{"jsonrpc":"2.0","id":"%s","result":{"ok":true}}\n' "$id"
        "#;
        let t = ProcessTransport::new(&cfg("bash", &["-c", script]), Duration::from_secs(5));
        t.connect().await.unwrap();

        let resp = t.send_request("ping", Some(serde_json::json!({}))).await.unwrap();
        assert_eq!(resp.result.unwrap()["ok"], true);
        t.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let t = ProcessTransport::new(&cfg("cat", &[]), Duration::from_secs(1));
        t.connect().await.unwrap();
        t.close().await;
        t.close().await;
        assert!(!t.is_connected().await);
    }

    #[tokio::test]
    async fn close_fails_pending_requests_with_closed() {
        let t = Arc::new(ProcessTransport::new(&cfg("sleep", &["5"]), Duration::from_secs(5)));
        t.connect().await.unwrap();

        let t2 = t.clone();
        let call = tokio::spawn(async move { t2.send_request("tools/list", None).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        t.close().await;

        let result = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .expect("close should unblock the pending call promptly")
            .unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
    }
}
