//! Persistent duplex channel: request correlation, broadcasts, frame fan-out.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use monitor_proto::{
    Frame, InitializeFrame, InitializeParams, InitializeResponseFrame, PROTOCOL_VERSION,
    RequestFrame, ResponseFrame,
};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio::task::JoinHandle;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Client name sent in the initialize handshake and used as the broadcast
    /// source until the peer assigns an id.
    pub client_name: String,
    pub client_version: Option<String>,
    pub default_timeout: Duration,
    pub broadcast_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            client_name: "agent-monitor".to_string(),
            client_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
            broadcast_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub target_client_id: Option<String>,
    pub version: Option<String>,
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn targeted(client_id: impl Into<String>) -> Self {
        Self {
            target_client_id: Some(client_id.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel is already connected")]
    AlreadyConnected,
    #[error("channel is not connected")]
    NotConnected,
    #[error("channel closed before a response arrived")]
    Closed,
    #[error("request {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },
    #[error("peer rejected {method}: {detail}")]
    Response { method: String, detail: String },
    #[error("channel transport failure: {0}")]
    Transport(String),
    #[error("channel protocol failure: {0}")]
    Protocol(String),
}

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;
type PendingSender = oneshot::Sender<Result<Frame, ChannelError>>;

struct Connection {
    writer: SharedWriter,
    reader_task: JoinHandle<()>,
}

struct Shared {
    config: ChannelConfig,
    next_request_id: AtomicU64,
    pending: StdMutex<HashMap<u64, PendingSender>>,
    frames_tx: broadcast::Sender<Frame>,
    conn: StdMutex<Option<Connection>>,
    assigned_client_id: StdMutex<Option<String>>,
}

/// One persistent stream connection carrying requests, responses, and
/// broadcasts. Request ids are allocated from a single monotonically
/// increasing counter shared with the initialize handshake.
pub struct DuplexChannel {
    shared: Arc<Shared>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DuplexChannel {
    pub fn new(config: ChannelConfig) -> Self {
        let (frames_tx, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                config,
                next_request_id: AtomicU64::new(1),
                pending: StdMutex::new(HashMap::new()),
                frames_tx,
                conn: StdMutex::new(None),
                assigned_client_id: StdMutex::new(None),
            }),
        }
    }

    /// Dial the agent's socket. Fails if a connection is already open.
    pub async fn connect(&self, path: &Path) -> Result<(), ChannelError> {
        if self.is_connected() {
            return Err(ChannelError::AlreadyConnected);
        }
        let stream = UnixStream::connect(path)
            .await
            .map_err(|error| ChannelError::Transport(error.to_string()))?;
        let (read_half, write_half) = stream.into_split();
        self.attach(Box::new(read_half), Box::new(write_half))
    }

    /// Attach an arbitrary stream pair instead of dialing a socket. Tests use
    /// `tokio::io::duplex` here.
    pub fn connect_with_io(
        &self,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Result<(), ChannelError> {
        self.attach(Box::new(reader), Box::new(writer))
    }

    fn attach(
        &self,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Result<(), ChannelError> {
        let mut conn = lock(&self.shared.conn);
        if conn.is_some() {
            return Err(ChannelError::AlreadyConnected);
        }
        let writer: SharedWriter = Arc::new(Mutex::new(writer));
        let reader_task = tokio::spawn(run_reader(Arc::clone(&self.shared), reader));
        *conn = Some(Connection {
            writer,
            reader_task,
        });
        Ok(())
    }

    /// Tear down the connection, rejecting every pending request. Safe to
    /// call when not connected.
    pub fn disconnect(&self) {
        let taken = lock(&self.shared.conn).take();
        if let Some(connection) = taken {
            connection.reader_task.abort();
        }
        reject_all_pending(&self.shared, &ChannelError::Closed);
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared.conn).is_some()
    }

    /// In-flight request count; mostly useful for health reporting and tests.
    pub fn pending_count(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    /// Subscribe to every inbound frame, correlated or not. A lagging or
    /// dropped subscriber never affects other listeners.
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.shared.frames_tx.subscribe()
    }

    pub async fn send_request_and_wait(
        &self,
        method: &str,
        params: Value,
        options: RequestOptions,
    ) -> Result<ResponseFrame, ChannelError> {
        let writer = self.writer()?;
        let request_id = self.shared.next_request_id.fetch_add(1, Ordering::SeqCst);
        let rx = self.register_pending(request_id);

        let frame = Frame::Request(RequestFrame {
            request_id,
            method: method.to_string(),
            params,
            source_client_id: lock(&self.shared.assigned_client_id).clone(),
            target_client_id: options.target_client_id,
            version: options
                .version
                .unwrap_or_else(|| PROTOCOL_VERSION.to_string()),
        });

        if let Err(error) = write_shared(&writer, &frame).await {
            self.remove_pending(request_id);
            return Err(error);
        }

        let timeout = options.timeout.unwrap_or(self.shared.config.default_timeout);
        match self.await_reply(method, request_id, timeout, rx).await? {
            Frame::Response(response) => {
                if let Some(error) = &response.error {
                    return Err(ChannelError::Response {
                        method: method.to_string(),
                        detail: error_detail(error),
                    });
                }
                Ok(response)
            }
            _ => Err(ChannelError::Protocol(format!(
                "unexpected reply frame type for {method}"
            ))),
        }
    }

    /// Fire-and-forget broadcast; no correlation, no response expected.
    pub async fn send_broadcast(
        &self,
        method: &str,
        params: Value,
        options: RequestOptions,
    ) -> Result<(), ChannelError> {
        let writer = self.writer()?;
        let source_client_id = lock(&self.shared.assigned_client_id)
            .clone()
            .unwrap_or_else(|| self.shared.config.client_name.clone());
        let frame = Frame::Broadcast(monitor_proto::BroadcastFrame {
            method: method.to_string(),
            params,
            source_client_id,
            version: options
                .version
                .unwrap_or_else(|| PROTOCOL_VERSION.to_string()),
            target_client_id: options.target_client_id,
        });
        write_shared(&writer, &frame).await
    }

    /// Distinguished first request establishing this client's identity.
    /// Shares the ordinary request-id space.
    pub async fn initialize(&self, user_agent: &str) -> Result<Value, ChannelError> {
        let writer = self.writer()?;
        let request_id = self.shared.next_request_id.fetch_add(1, Ordering::SeqCst);
        let rx = self.register_pending(request_id);

        let frame = Frame::Initialize(InitializeFrame {
            request_id,
            params: InitializeParams {
                client_name: self.shared.config.client_name.clone(),
                client_version: self.shared.config.client_version.clone(),
                user_agent: user_agent.to_string(),
            },
        });

        if let Err(error) = write_shared(&writer, &frame).await {
            self.remove_pending(request_id);
            return Err(error);
        }

        let timeout = self.shared.config.default_timeout;
        let result = match self
            .await_reply("initialize", request_id, timeout, rx)
            .await?
        {
            Frame::InitializeResponse(InitializeResponseFrame { result, .. }) => {
                result.unwrap_or(Value::Null)
            }
            Frame::Response(response) => {
                if let Some(error) = &response.error {
                    return Err(ChannelError::Response {
                        method: "initialize".to_string(),
                        detail: error_detail(error),
                    });
                }
                response.result.unwrap_or(Value::Null)
            }
            _ => {
                return Err(ChannelError::Protocol(
                    "unexpected reply frame type for initialize".to_string(),
                ));
            }
        };

        if let Some(client_id) = result.get("clientId").and_then(Value::as_str) {
            *lock(&self.shared.assigned_client_id) = Some(client_id.to_string());
        }
        Ok(result)
    }

    /// Identity assigned by the peer during the initialize handshake.
    pub fn assigned_client_id(&self) -> Option<String> {
        lock(&self.shared.assigned_client_id).clone()
    }

    fn writer(&self) -> Result<SharedWriter, ChannelError> {
        lock(&self.shared.conn)
            .as_ref()
            .map(|connection| Arc::clone(&connection.writer))
            .ok_or(ChannelError::NotConnected)
    }

    fn register_pending(&self, request_id: u64) -> oneshot::Receiver<Result<Frame, ChannelError>> {
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(request_id, tx);
        rx
    }

    fn remove_pending(&self, request_id: u64) {
        lock(&self.shared.pending).remove(&request_id);
    }

    async fn await_reply(
        &self,
        method: &str,
        request_id: u64,
        timeout: Duration,
        rx: oneshot::Receiver<Result<Frame, ChannelError>>,
    ) -> Result<Frame, ChannelError> {
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                self.remove_pending(request_id);
                Err(ChannelError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
            Ok(Err(_)) => Err(ChannelError::Closed),
            Ok(Ok(result)) => result,
        }
    }
}

impl Drop for DuplexChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn write_shared(writer: &SharedWriter, frame: &Frame) -> Result<(), ChannelError> {
    let mut guard = writer.lock().await;
    crate::codec::write_frame(&mut **guard, frame)
        .await
        .map_err(|error| ChannelError::Transport(error.to_string()))
}

async fn run_reader(shared: Arc<Shared>, mut reader: Box<dyn AsyncRead + Send + Unpin>) {
    loop {
        match crate::codec::read_frame(&mut *reader).await {
            Ok(Some(frame)) => {
                if let Some(request_id) = frame.correlation_id() {
                    let sender = lock(&shared.pending).remove(&request_id);
                    if let Some(sender) = sender {
                        let _ = sender.send(Ok(frame.clone()));
                    } else {
                        tracing::debug!(request_id, "reply without a pending request");
                    }
                }
                let _ = shared.frames_tx.send(frame);
            }
            Ok(None) => {
                reject_all_pending(&shared, &ChannelError::Closed);
                break;
            }
            Err(error) => {
                // Fail closed: a corrupt stream poisons every in-flight
                // request, not just the frame that failed to parse.
                tracing::warn!(error = %error, "duplex channel read failed");
                reject_all_pending(&shared, &ChannelError::Protocol(error.to_string()));
                break;
            }
        }
    }
    *lock(&shared.conn) = None;
}

fn reject_all_pending(shared: &Arc<Shared>, error: &ChannelError) {
    let drained: Vec<PendingSender> = {
        let mut pending = lock(&shared.pending);
        pending.drain().map(|(_, sender)| sender).collect()
    };
    for sender in drained {
        let _ = sender.send(Err(error.clone()));
    }
}

fn error_detail(error: &Value) -> String {
    if let Some(text) = error.as_str() {
        return text.to_string();
    }
    if let Some(message) = error.get("message").and_then(Value::as_str) {
        return message.to_string();
    }
    error.to_string()
}
