//! JSON-RPC transport over the codex subprocess's stdio.
//!
//! Newline-delimited JSON both ways. The backend starts on demand and is
//! respawned on next use after an exit; an exit rejects every pending call.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

use crate::discovery::resolve_backend_command;
use crate::error::RpcError;
use crate::types::*;

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Default)]
pub struct CodexBackendConfig {
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub default_timeout: Option<Duration>,
}

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;
type PendingCalls = Arc<StdMutex<HashMap<i64, oneshot::Sender<Result<Value, RpcError>>>>>;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct RpcConnection {
    stdin: SharedWriter,
    pending: PendingCalls,
    next_id: Arc<AtomicI64>,
    alive: Arc<AtomicBool>,
    child: Option<Child>,
    reader_task: JoinHandle<()>,
    stderr_task: Option<JoinHandle<()>>,
}

impl RpcConnection {
    fn teardown(mut self, error: &RpcError) {
        self.reader_task.abort();
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
        }
        reject_pending(&self.pending, error);
    }
}

/// Request/response correlation over the backend subprocess.
pub struct CodexRpc {
    config: CodexBackendConfig,
    conn: Mutex<Option<RpcConnection>>,
    closed: AtomicBool,
}

struct CallHandles {
    stdin: SharedWriter,
    pending: PendingCalls,
    next_id: Arc<AtomicI64>,
    alive: Arc<AtomicBool>,
}

impl CodexRpc {
    pub fn new(config: CodexBackendConfig) -> Self {
        Self {
            config,
            conn: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Build an already-connected client over an arbitrary stream pair
    /// instead of spawning a subprocess. Tests use `tokio::io::duplex` here.
    pub fn connect_with_io(
        config: CodexBackendConfig,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        let connection = build_connection(Box::new(reader), Box::new(writer), None, None);
        Self {
            config,
            conn: Mutex::new(Some(connection)),
            closed: AtomicBool::new(false),
        }
    }

    /// Raw request with per-call timeout override.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        let handles = self.handles().await?;
        let id = handles.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&handles.pending).insert(id, tx);

        let payload = serde_json::json!({
            "id": id,
            "method": method,
            "params": params,
        });
        let mut line = payload.to_string();
        line.push('\n');

        let write_result = {
            let mut stdin = handles.stdin.lock().await;
            match stdin.write_all(line.as_bytes()).await {
                Ok(()) => stdin.flush().await,
                Err(error) => Err(error),
            }
        };
        if let Err(error) = write_result {
            lock(&handles.pending).remove(&id);
            handles.alive.store(false, Ordering::SeqCst);
            return Err(RpcError::Transport(format!("backend write failed: {error}")));
        }

        let timeout = timeout
            .or(self.config.default_timeout)
            .unwrap_or(DEFAULT_RPC_TIMEOUT);
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                lock(&handles.pending).remove(&id);
                Err(RpcError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
            Ok(Err(_)) => Err(RpcError::Transport(
                "backend reply channel dropped".to_string(),
            )),
            Ok(Ok(result)) => result,
        }
    }

    pub(crate) async fn call<P, R>(&self, method: &str, params: &P) -> Result<R, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params).map_err(|error| RpcError::Decode {
            method: method.to_string(),
            message: format!("param encode failed: {error}"),
        })?;
        let result = self.request(method, params, None).await?;
        serde_json::from_value(result).map_err(|error| RpcError::Decode {
            method: method.to_string(),
            message: error.to_string(),
        })
    }

    pub async fn thread_list(&self, params: ThreadListParams) -> Result<ThreadListResponse, RpcError> {
        self.call("thread/list", &params).await
    }

    pub async fn thread_read(&self, params: ThreadReadParams) -> Result<ThreadReadResponse, RpcError> {
        self.call("thread/read", &params).await
    }

    pub async fn thread_start(
        &self,
        params: ThreadStartParams,
    ) -> Result<ThreadStartResponse, RpcError> {
        self.call("thread/start", &params).await
    }

    pub async fn thread_resume(
        &self,
        params: ThreadResumeParams,
    ) -> Result<ThreadResumeResponse, RpcError> {
        self.call("thread/resume", &params).await
    }

    pub async fn turn_start(&self, params: TurnStartParams) -> Result<TurnStartResponse, RpcError> {
        self.call("turn/start", &params).await
    }

    pub async fn turn_steer(&self, params: TurnSteerParams) -> Result<TurnSteerResponse, RpcError> {
        self.call("turn/steer", &params).await
    }

    pub async fn turn_interrupt(
        &self,
        params: TurnInterruptParams,
    ) -> Result<TurnInterruptResponse, RpcError> {
        self.call("turn/interrupt", &params).await
    }

    pub async fn model_list(&self, params: ModelListParams) -> Result<ModelListResponse, RpcError> {
        self.call("model/list", &params).await
    }

    pub async fn collaboration_mode_list(
        &self,
        params: CollaborationModeListParams,
    ) -> Result<CollaborationModeListResponse, RpcError> {
        self.call("collaborationMode/list", &params).await
    }

    /// Terminate the backend and reject everything in flight. Idempotent;
    /// the client cannot be reused afterwards.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let taken = self.conn.lock().await.take();
        if let Some(connection) = taken {
            connection.teardown(&RpcError::Closed);
        }
    }

    async fn handles(&self) -> Result<CallHandles, RpcError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Closed);
        }
        let mut guard = self.conn.lock().await;
        let needs_spawn = match guard.as_ref() {
            Some(connection) => !connection.alive.load(Ordering::SeqCst),
            None => true,
        };
        if needs_spawn {
            if let Some(dead) = guard.take() {
                dead.teardown(&RpcError::Transport(
                    "backend process exited".to_string(),
                ));
            }
            *guard = Some(self.spawn_backend()?);
        }
        let connection = guard
            .as_ref()
            .ok_or_else(|| RpcError::Transport("backend unavailable".to_string()))?;
        Ok(CallHandles {
            stdin: Arc::clone(&connection.stdin),
            pending: Arc::clone(&connection.pending),
            next_id: Arc::clone(&connection.next_id),
            alive: Arc::clone(&connection.alive),
        })
    }

    fn spawn_backend(&self) -> Result<RpcConnection, RpcError> {
        let command = resolve_backend_command()?;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.config.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|error| {
            if error.kind() == std::io::ErrorKind::NotFound {
                RpcError::ExecutableNotFound
            } else {
                RpcError::Transport(format!("backend spawn failed: {error}"))
            }
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RpcError::Transport("backend stdin missing".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RpcError::Transport("backend stdout missing".to_string()))?;
        let stderr = child.stderr.take();

        tracing::info!(program = %command.program.display(), "codex backend started");
        Ok(build_connection(
            Box::new(stdout),
            Box::new(stdin),
            Some(child),
            stderr.map(|stderr| Box::new(stderr) as Box<dyn AsyncRead + Send + Unpin>),
        ))
    }
}

fn build_connection(
    stdout: Box<dyn AsyncRead + Send + Unpin>,
    stdin: Box<dyn AsyncWrite + Send + Unpin>,
    child: Option<Child>,
    stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
) -> RpcConnection {
    let pending: PendingCalls = Arc::new(StdMutex::new(HashMap::new()));
    let alive = Arc::new(AtomicBool::new(true));
    let last_stderr: Arc<StdMutex<Option<String>>> = Arc::new(StdMutex::new(None));

    let stderr_task = stderr.map(|stderr| {
        let last_stderr = Arc::clone(&last_stderr);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                tracing::warn!(line = %trimmed, "codex backend stderr");
                *lock(&last_stderr) = Some(trimmed.to_string());
            }
        })
    });

    let reader_task = {
        let pending = Arc::clone(&pending);
        let alive = Arc::clone(&alive);
        let last_stderr = Arc::clone(&last_stderr);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let exit_error = loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break exit_message(&last_stderr),
                    Err(error) => {
                        break RpcError::Transport(format!("backend read failed: {error}"));
                    }
                };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let value: Value = match serde_json::from_str(trimmed) {
                    Ok(value) => value,
                    Err(error) => {
                        tracing::warn!(error = %error, "codex backend emitted malformed output");
                        break RpcError::Transport(format!(
                            "malformed backend output: {error}"
                        ));
                    }
                };

                let id = value.get("id").and_then(Value::as_i64);
                let method = value.get("method").and_then(Value::as_str);
                match (id, method) {
                    (None, Some(method)) => {
                        tracing::debug!(method, "codex backend notification");
                    }
                    (Some(_), Some(method)) => {
                        tracing::debug!(method, "ignoring backend-initiated request");
                    }
                    (Some(id), None) => {
                        let outcome = if let Some(error) = value.get("error") {
                            let code = error.get("code").and_then(Value::as_i64).unwrap_or(-1);
                            let message = error
                                .get("message")
                                .and_then(Value::as_str)
                                .unwrap_or("unknown error")
                                .to_string();
                            Err(RpcError::Backend { code, message })
                        } else {
                            Ok(value.get("result").cloned().unwrap_or(Value::Null))
                        };
                        let sender = lock(&pending).remove(&id);
                        if let Some(sender) = sender {
                            let _ = sender.send(outcome);
                        } else {
                            tracing::debug!(id, "backend response without pending call");
                        }
                    }
                    (None, None) => {
                        tracing::debug!("ignoring backend line without id or method");
                    }
                }
            };

            alive.store(false, Ordering::SeqCst);
            reject_pending(&pending, &exit_error);
        })
    };

    RpcConnection {
        stdin: Arc::new(Mutex::new(stdin)),
        pending,
        next_id: Arc::new(AtomicI64::new(1)),
        alive,
        child,
        reader_task,
        stderr_task,
    }
}

fn exit_message(last_stderr: &Arc<StdMutex<Option<String>>>) -> RpcError {
    match lock(last_stderr).clone() {
        Some(line) => RpcError::Transport(format!("backend process exited: {line}")),
        None => RpcError::Transport("backend process exited".to_string()),
    }
}

fn reject_pending(pending: &PendingCalls, error: &RpcError) {
    let drained: Vec<oneshot::Sender<Result<Value, RpcError>>> = {
        let mut map = lock(pending);
        map.drain().map(|(_, sender)| sender).collect()
    };
    for sender in drained {
        let _ = sender.send(Err(error.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

    fn connected_rpc() -> (CodexRpc, ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) {
        let (ours, theirs) = tokio::io::duplex(16 * 1024);
        let (our_read, our_write) = tokio::io::split(ours);
        let (peer_read, peer_write) = tokio::io::split(theirs);
        let rpc = CodexRpc::connect_with_io(CodexBackendConfig::default(), our_read, our_write);
        (rpc, peer_read, peer_write)
    }

    async fn next_request(reader: &mut BufReader<ReadHalf<DuplexStream>>) -> Value {
        let mut line = String::new();
        reader.read_line(&mut line).await.expect("request line");
        serde_json::from_str(line.trim()).expect("request json")
    }

    async fn respond(writer: &mut WriteHalf<DuplexStream>, reply: Value) {
        use tokio::io::AsyncWriteExt;
        let mut line = reply.to_string();
        line.push('\n');
        writer.write_all(line.as_bytes()).await.expect("reply write");
    }

    #[tokio::test]
    async fn requests_correlate_by_incrementing_id() {
        let (rpc, peer_read, mut peer_write) = connected_rpc();
        let mut reader = BufReader::new(peer_read);

        let call = tokio::spawn(async move {
            rpc.request("thread/list", json!({"limit": 1}), None).await
        });

        let request = next_request(&mut reader).await;
        assert_eq!(request.get("id").and_then(Value::as_i64), Some(1));
        assert_eq!(
            request.get("method").and_then(Value::as_str),
            Some("thread/list")
        );
        respond(&mut peer_write, json!({"id": 1, "result": {"data": []}})).await;

        let result = call.await.expect("join").expect("result");
        assert_eq!(result, json!({"data": []}));
    }

    #[tokio::test]
    async fn backend_errors_are_distinct_from_transport_errors() {
        let (rpc, peer_read, mut peer_write) = connected_rpc();
        let mut reader = BufReader::new(peer_read);

        let call = tokio::spawn(async move {
            rpc.request("thread/read", json!({"threadId": "thr-9"}), None)
                .await
        });

        let request = next_request(&mut reader).await;
        let id = request.get("id").and_then(Value::as_i64).unwrap_or(0);
        respond(
            &mut peer_write,
            json!({"id": id, "error": {"code": -32001, "message": "thread not found"}}),
        )
        .await;

        let error = call.await.expect("join").expect_err("backend error");
        assert_eq!(
            error,
            RpcError::Backend {
                code: -32001,
                message: "thread not found".to_string(),
            }
        );
        assert!(!error.is_backend_down());
        assert!(error.is_thread_not_found());
    }

    #[tokio::test]
    async fn process_exit_rejects_pending_calls() {
        let (rpc, peer_read, peer_write) = connected_rpc();

        let call = tokio::spawn(async move {
            rpc.request("thread/list", json!({}), Some(Duration::from_secs(5)))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(peer_write);
        drop(peer_read);

        let error = call.await.expect("join").expect_err("must fail");
        assert!(matches!(error, RpcError::Transport(_)));
        assert!(error.is_backend_down());
    }

    #[tokio::test]
    async fn per_call_timeout_overrides_the_default() {
        let (rpc, _peer_read, _peer_write) = connected_rpc();
        let started = std::time::Instant::now();
        let error = rpc
            .request("thread/list", json!({}), Some(Duration::from_millis(50)))
            .await
            .expect_err("must time out");
        assert!(matches!(error, RpcError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn malformed_output_fails_the_connection_closed() {
        use tokio::io::AsyncWriteExt;
        let (rpc, _peer_read, mut peer_write) = connected_rpc();

        let call = tokio::spawn(async move {
            rpc.request("thread/list", json!({}), Some(Duration::from_secs(5)))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        peer_write
            .write_all(b"garbage line\n")
            .await
            .expect("write");

        let error = call.await.expect("join").expect_err("must fail");
        assert!(matches!(error, RpcError::Transport(_)));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_terminal() {
        let (rpc, _peer_read, _peer_write) = connected_rpc();
        rpc.close().await;
        rpc.close().await;
        let error = rpc
            .request("thread/list", json!({}), None)
            .await
            .expect_err("closed");
        assert_eq!(error, RpcError::Closed);
    }

    #[tokio::test]
    async fn typed_wrappers_decode_responses() {
        let (rpc, peer_read, mut peer_write) = connected_rpc();
        let mut reader = BufReader::new(peer_read);

        let call = tokio::spawn(async move {
            rpc.thread_list(ThreadListParams {
                limit: Some(2),
                ..Default::default()
            })
            .await
        });

        let request = next_request(&mut reader).await;
        assert_eq!(
            request.pointer("/params/limit").and_then(Value::as_u64),
            Some(2)
        );
        respond(
            &mut peer_write,
            json!({"id": 1, "result": {"data": [
                {"id": "thr-1", "preview": "fix the tests", "updatedAt": 2, "createdAt": 1},
            ]}}),
        )
        .await;

        let response = call.await.expect("join").expect("decoded");
        assert_eq!(response.data.len(), 1);
        assert_eq!(response.data[0].id, "thr-1");
    }
}
