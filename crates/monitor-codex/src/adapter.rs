//! Adapter orchestration: bootstrap, reconnection, and thread operations
//! spanning the RPC backend and the duplex channel.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use monitor_ipc::{ChannelConfig, ChannelError, DuplexChannel, RequestOptions};
use monitor_proto::{BroadcastFrame, ConversationState, Frame, STREAM_EVENT_METHOD, StreamEvent};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::buffer::ThreadEventBuffers;
use crate::error::RpcError;
use crate::live_state::{ReductionError, reduce_stream_events};
use crate::ownership::{OwnershipError, OwnershipRegistry};
use crate::rpc::{CodexBackendConfig, CodexRpc};
use crate::runtime_state::{RuntimeState, RuntimeStateCell};
use crate::types::*;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Socket the desktop agent listens on for the framed IPC protocol.
    pub socket_path: PathBuf,
    pub user_agent: String,
    pub backend: CodexBackendConfig,
    pub channel: ChannelConfig,
    pub reconnect_delay: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            user_agent: format!("agent-monitor/{}", env!("CARGO_PKG_VERSION")),
            backend: CodexBackendConfig::default(),
            channel: ChannelConfig::default(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

fn default_socket_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".codex/monitor.sock"))
        .unwrap_or_else(|| PathBuf::from("/tmp/codex-monitor.sock"))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("codex backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Ownership(#[from] OwnershipError),
    #[error("no active turn for thread {thread_id}")]
    NoActiveTurn { thread_id: String },
    #[error("adapter is stopped")]
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LiveStateError {
    #[error(transparent)]
    ReductionFailed(#[from] ReductionError),
}

/// Materialized view of a thread's live state. On reduction failure the
/// state degrades to the last known good read instead of going blank.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveState {
    pub conversation_state: Option<Value>,
    pub owner_client_id: Option<String>,
    pub live_state_error: Option<LiveStateError>,
}

#[derive(Debug, Clone, Default)]
pub struct SendMessageOptions {
    pub model: Option<String>,
    pub effort: Option<String>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cancellable one-shot timer; at most one scheduled task at a time.
#[derive(Debug, Default)]
struct RetryTimer {
    handle: StdMutex<Option<JoinHandle<()>>>,
}

impl RetryTimer {
    fn schedule<F>(&self, delay: Duration, action: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = lock(&self.handle);
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
        }));
        true
    }

    fn cancel(&self) {
        if let Some(handle) = lock(&self.handle).take() {
            handle.abort();
        }
    }
}

type BootstrapSignal = watch::Receiver<Option<Result<(), AdapterError>>>;

struct AdapterShared {
    config: AdapterConfig,
    rpc: CodexRpc,
    channel: DuplexChannel,
    runtime: RuntimeStateCell,
    ownership: StdMutex<OwnershipRegistry>,
    buffers: StdMutex<ThreadEventBuffers>,
    last_reads: StdMutex<HashMap<String, Value>>,
    inflight: StdMutex<Option<BootstrapSignal>>,
    retry: RetryTimer,
    listener: StdMutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

/// One codex adapter instance. Owns its transports, runtime state, ownership
/// registry, and per-thread event buffers; nothing here is shared between
/// instances.
pub struct CodexAdapter {
    inner: Arc<AdapterShared>,
}

impl CodexAdapter {
    pub fn new(config: AdapterConfig) -> Self {
        let rpc = CodexRpc::new(config.backend.clone());
        let channel = DuplexChannel::new(config.channel.clone());
        Self::with_transports(config, rpc, channel)
    }

    /// Wire in transports directly. Tests attach in-memory streams through
    /// `CodexRpc::connect_with_io` and `DuplexChannel::connect_with_io`.
    pub fn with_transports(config: AdapterConfig, rpc: CodexRpc, channel: DuplexChannel) -> Self {
        Self {
            inner: Arc::new(AdapterShared {
                config,
                rpc,
                channel,
                runtime: RuntimeStateCell::new(),
                ownership: StdMutex::new(OwnershipRegistry::default()),
                buffers: StdMutex::new(ThreadEventBuffers::default()),
                last_reads: StdMutex::new(HashMap::new()),
                inflight: StdMutex::new(None),
                retry: RetryTimer::default(),
                listener: StdMutex::new(None),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Run the bootstrap sequence: probe the backend, connect the channel,
    /// perform the initialize handshake. Concurrent calls join the attempt
    /// already in flight.
    pub async fn start(&self) -> Result<(), AdapterError> {
        bootstrap(&self.inner).await
    }

    /// Cancel reconnects, tear down both transports. The adapter cannot be
    /// restarted afterwards.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.retry.cancel();
        if let Some(task) = lock(&self.inner.listener).take() {
            task.abort();
        }
        self.inner.channel.disconnect();
        self.inner.rpc.close().await;
        self.inner.runtime.update(|state| {
            state.app_ready = false;
            state.ipc_connected = false;
            state.ipc_initialized = false;
        });
    }

    pub fn runtime_state(&self) -> RuntimeState {
        self.inner.runtime.current()
    }

    pub fn subscribe_runtime_state(&self) -> watch::Receiver<RuntimeState> {
        self.inner.runtime.subscribe()
    }

    pub async fn list_threads(
        &self,
        params: ThreadListParams,
    ) -> Result<ThreadListResponse, AdapterError> {
        Ok(self.rpc_call(self.inner.rpc.thread_list(params)).await?)
    }

    pub async fn create_thread(
        &self,
        params: ThreadStartParams,
    ) -> Result<ConversationState, AdapterError> {
        let response = self.rpc_call(self.inner.rpc.thread_start(params)).await?;
        self.remember_read(&response.thread);
        Ok(response.thread)
    }

    pub async fn read_thread(&self, thread_id: &str) -> Result<ConversationState, AdapterError> {
        let response = self
            .rpc_call(self.inner.rpc.thread_read(ThreadReadParams {
                thread_id: thread_id.to_string(),
                include_turns: true,
            }))
            .await?;
        self.remember_read(&response.thread);
        Ok(response.thread)
    }

    /// Start a new turn carrying the user's message. A thread evicted from
    /// the backend's working set is resumed and the send retried once.
    pub async fn send_message(
        &self,
        thread_id: &str,
        text: &str,
        options: SendMessageOptions,
    ) -> Result<TurnStartResponse, AdapterError> {
        let params = TurnStartParams {
            thread_id: thread_id.to_string(),
            input: vec![InputItem::Text {
                text: text.to_string(),
            }],
            model: options.model,
            effort: options.effort,
        };
        let rpc = &self.inner.rpc;
        self.with_resume_retry(thread_id, move || {
            let params = params.clone();
            async move { rpc.turn_start(params).await }
        })
        .await
    }

    /// Steer the active turn with additional input. Requires a non-terminal
    /// turn; steering nothing is an error, unlike interrupt.
    pub async fn steer_turn(
        &self,
        thread_id: &str,
        text: &str,
    ) -> Result<TurnSteerResponse, AdapterError> {
        let thread = self.read_thread(thread_id).await?;
        let Some(turn) = thread.active_turn() else {
            return Err(AdapterError::NoActiveTurn {
                thread_id: thread_id.to_string(),
            });
        };
        Ok(self
            .rpc_call(self.inner.rpc.turn_steer(TurnSteerParams {
                thread_id: thread_id.to_string(),
                turn_id: turn.turn_id.clone(),
                input: vec![InputItem::Text {
                    text: text.to_string(),
                }],
            }))
            .await?)
    }

    /// Interrupt the active turn, if any. With no active turn there is
    /// nothing to interrupt and the call is a no-op returning `None`.
    pub async fn interrupt(&self, thread_id: &str) -> Result<Option<String>, AdapterError> {
        let rpc = &self.inner.rpc;
        self.with_resume_retry(thread_id, move || {
            let thread_id = thread_id.to_string();
            async move {
                let response = rpc
                    .thread_read(ThreadReadParams {
                        thread_id: thread_id.clone(),
                        include_turns: true,
                    })
                    .await?;
                let Some(turn) = response.thread.active_turn() else {
                    return Ok(None);
                };
                let turn_id = turn.turn_id.clone();
                rpc.turn_interrupt(TurnInterruptParams {
                    thread_id,
                    turn_id: turn_id.clone(),
                })
                .await?;
                Ok(Some(turn_id))
            }
        })
        .await
    }

    pub async fn list_models(&self) -> Result<ModelListResponse, AdapterError> {
        Ok(self
            .rpc_call(self.inner.rpc.model_list(ModelListParams::default()))
            .await?)
    }

    pub async fn list_collaboration_modes(
        &self,
    ) -> Result<CollaborationModeListResponse, AdapterError> {
        Ok(self
            .rpc_call(
                self.inner
                    .rpc
                    .collaboration_mode_list(CollaborationModeListParams::default()),
            )
            .await?)
    }

    /// Directly-addressed request to the client owning the thread. Fails
    /// loudly when no owner can be resolved; a misdirected mode change is
    /// worse than no mode change.
    pub async fn set_collaboration_mode(
        &self,
        thread_id: &str,
        mode: &str,
        owner_override: Option<&str>,
    ) -> Result<Value, AdapterError> {
        let owner = self.resolve_owner_client_id(thread_id, owner_override)?;
        let response = self
            .inner
            .channel
            .send_request_and_wait(
                "collaborationMode/set",
                json!({"conversationId": thread_id, "mode": mode}),
                RequestOptions::targeted(owner),
            )
            .await
            .inspect_err(|error| self.note_channel_failure(error))?;
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Answer a pending user-input or approval request on the owning client.
    pub async fn submit_user_input(
        &self,
        thread_id: &str,
        request_id: &str,
        answers: Value,
        owner_override: Option<&str>,
    ) -> Result<Value, AdapterError> {
        let owner = self.resolve_owner_client_id(thread_id, owner_override)?;
        let response = self
            .inner
            .channel
            .send_request_and_wait(
                "userInput/submit",
                json!({
                    "conversationId": thread_id,
                    "requestId": request_id,
                    "response": answers,
                }),
                RequestOptions::targeted(owner),
            )
            .await
            .inspect_err(|error| self.note_channel_failure(error))?;
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// A dead channel pushes the state machine back through reconnect, as
    /// long as the backend is still considered available.
    fn note_channel_failure(&self, error: &ChannelError) {
        let disconnected = matches!(
            error,
            ChannelError::NotConnected
                | ChannelError::Closed
                | ChannelError::Protocol(_)
                | ChannelError::Transport(_)
        );
        if !disconnected {
            return;
        }
        let message = error.to_string();
        let connected = self.inner.channel.is_connected();
        self.inner.runtime.update(|state| {
            state.ipc_connected = connected;
            state.ipc_initialized = false;
            state.last_error = Some(message);
        });
        schedule_reconnect(&self.inner);
    }

    pub fn resolve_owner_client_id(
        &self,
        thread_id: &str,
        owner_override: Option<&str>,
    ) -> Result<String, OwnershipError> {
        lock(&self.inner.ownership).resolve(thread_id, owner_override)
    }

    /// Rebuild the thread's live state: a synthetic snapshot from the last
    /// persisted read, then every buffered stream event since, folded in
    /// arrival order. Invalid buffered events are pruned along the way.
    pub fn read_live_state(&self, thread_id: &str) -> LiveState {
        let events = lock(&self.inner.buffers).materialize(thread_id);
        let last_read = lock(&self.inner.last_reads).get(thread_id).cloned();
        let fallback_owner = lock(&self.inner.ownership)
            .owner_of(thread_id)
            .map(str::to_string);

        let mut sequence = Vec::with_capacity(events.len() + 1);
        if let Some(base) = last_read.clone() {
            sequence.push(StreamEvent::synthetic_snapshot(thread_id, base));
        }
        sequence.extend(events);

        if sequence.is_empty() {
            return LiveState {
                conversation_state: None,
                owner_client_id: fallback_owner,
                live_state_error: None,
            };
        }

        let outcome = reduce_stream_events(&sequence);
        if let Some(reduced) = outcome.threads.get(thread_id) {
            return LiveState {
                conversation_state: Some(reduced.conversation_state.clone()),
                owner_client_id: reduced.owner_client_id.clone().or(fallback_owner),
                live_state_error: None,
            };
        }

        let failure = outcome.failures.get(thread_id).cloned();
        if let Some(failure) = &failure {
            tracing::warn!(
                thread_id,
                event_index = failure.event_index,
                patch_index = failure.patch_index,
                "live state degraded to last known good"
            );
        }
        LiveState {
            conversation_state: last_read,
            owner_client_id: fallback_owner,
            live_state_error: failure.map(LiveStateError::from),
        }
    }

    /// Raw buffered broadcasts for a thread, in arrival order.
    pub fn read_stream_events(&self, thread_id: &str) -> Vec<BroadcastFrame> {
        lock(&self.inner.buffers).raw_events(thread_id)
    }

    /// Distinct working directories across known threads, most recent first.
    pub async fn list_project_directories(&self) -> Result<Vec<String>, AdapterError> {
        let response = self
            .rpc_call(self.inner.rpc.thread_list(ThreadListParams {
                limit: Some(100),
                ..Default::default()
            }))
            .await?;

        let mut entries = response.data;
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        let mut seen = HashSet::new();
        let mut directories = Vec::new();
        for entry in entries {
            let Some(cwd) = entry.cwd else { continue };
            let cwd = cwd.display().to_string();
            if seen.insert(cwd.clone()) {
                directories.push(cwd);
            }
        }
        Ok(directories)
    }

    fn remember_read(&self, thread: &ConversationState) {
        if thread.id.is_empty() {
            return;
        }
        match serde_json::to_value(thread) {
            Ok(value) => {
                lock(&self.inner.last_reads).insert(thread.id.clone(), value);
            }
            Err(error) => {
                tracing::warn!(error = %error, thread_id = %thread.id, "read snapshot not kept");
            }
        }
    }

    async fn rpc_call<T>(
        &self,
        call: impl Future<Output = Result<T, RpcError>>,
    ) -> Result<T, RpcError> {
        note_rpc(&self.inner, call.await)
    }

    /// First attempt directly; on a not-found/not-loaded class error, resume
    /// the thread and retry exactly once. Any further failure propagates.
    async fn with_resume_retry<T, F, Fut>(
        &self,
        thread_id: &str,
        attempt: F,
    ) -> Result<T, AdapterError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        match self.rpc_call(attempt()).await {
            Err(error) if error.is_thread_not_found() => {
                tracing::info!(thread_id, "thread not loaded; resuming and retrying once");
                self.rpc_call(self.inner.rpc.thread_resume(ThreadResumeParams {
                    thread_id: thread_id.to_string(),
                }))
                .await?;
                Ok(self.rpc_call(attempt()).await?)
            }
            other => Ok(other?),
        }
    }
}

/// Derive `app_ready`/`last_error` from the outcome of every RPC call: a
/// transport-level failure means the backend process is down, an RPC-level
/// error means the backend is up but rejected this call.
fn note_rpc<T>(inner: &AdapterShared, result: Result<T, RpcError>) -> Result<T, RpcError> {
    match &result {
        Ok(_) => inner.runtime.update(|state| {
            state.app_ready = true;
            state.codex_available = true;
            state.last_error = None;
        }),
        Err(RpcError::ExecutableNotFound) => inner.runtime.update(|state| {
            state.app_ready = false;
            state.codex_available = false;
            state.last_error = Some(RpcError::ExecutableNotFound.to_string());
        }),
        Err(error) if error.is_backend_down() => {
            let message = error.to_string();
            inner.runtime.update(|state| {
                state.app_ready = false;
                state.last_error = Some(message);
            });
        }
        Err(error) => {
            let message = error.to_string();
            inner.runtime.update(|state| {
                state.app_ready = true;
                state.last_error = Some(message);
            });
        }
    }
    result
}

async fn bootstrap(inner: &Arc<AdapterShared>) -> Result<(), AdapterError> {
    if inner.stopped.load(Ordering::SeqCst) {
        return Err(AdapterError::Stopped);
    }

    let mut rx = {
        let mut slot = lock(&inner.inflight);
        if let Some(rx) = slot.clone() {
            rx
        } else {
            let (tx, rx) = watch::channel(None);
            *slot = Some(rx.clone());
            let shared = Arc::clone(inner);
            tokio::spawn(async move {
                let result = run_bootstrap(&shared).await;
                *lock(&shared.inflight) = None;
                let _ = tx.send(Some(result));
            });
            rx
        }
    };

    loop {
        if let Some(result) = rx.borrow_and_update().clone() {
            return result;
        }
        if rx.changed().await.is_err() {
            return Err(AdapterError::Stopped);
        }
    }
}

async fn run_bootstrap(inner: &Arc<AdapterShared>) -> Result<(), AdapterError> {
    if inner.stopped.load(Ordering::SeqCst) {
        return Err(AdapterError::Stopped);
    }

    // Step 1: a light list call detects whether the backend exists at all.
    let probe = note_rpc(
        inner,
        inner
            .rpc
            .thread_list(ThreadListParams {
                limit: Some(1),
                ..Default::default()
            })
            .await,
    );
    match probe {
        Err(RpcError::ExecutableNotFound) => {
            // Permanently unavailable for this adapter instance: no channel
            // attempt, no reconnect timer.
            return Err(AdapterError::BackendUnavailable(
                RpcError::ExecutableNotFound.to_string(),
            ));
        }
        Err(error) => {
            tracing::warn!(error = %error, "backend probe failed; continuing to channel");
        }
        Ok(_) => {}
    }

    // Step 2: duplex channel plus the initialize handshake.
    if !inner.channel.is_connected() {
        if let Err(error) = inner.channel.connect(&inner.config.socket_path).await {
            return fail_channel(inner, error);
        }
    }
    inner.runtime.update(|state| state.ipc_connected = true);
    ensure_frame_listener(inner);

    if let Err(error) = inner.channel.initialize(&inner.config.user_agent).await {
        return fail_channel(inner, error);
    }
    inner.runtime.update(|state| {
        state.ipc_initialized = true;
        state.last_error = None;
    });
    tracing::info!("codex adapter ready");
    Ok(())
}

fn fail_channel(inner: &Arc<AdapterShared>, error: ChannelError) -> Result<(), AdapterError> {
    let message = error.to_string();
    tracing::warn!(error = %message, "channel bootstrap failed");
    inner.runtime.update(|state| {
        state.ipc_initialized = false;
        state.last_error = Some(message);
    });
    schedule_reconnect(inner);
    Err(AdapterError::Channel(error))
}

fn schedule_reconnect(inner: &Arc<AdapterShared>) {
    if inner.stopped.load(Ordering::SeqCst) {
        return;
    }
    let shared = Arc::clone(inner);
    let delay = inner.config.reconnect_delay;
    let scheduled = inner.retry.schedule(delay, async move {
        if shared.stopped.load(Ordering::SeqCst) {
            return;
        }
        if !shared.runtime.current().codex_available {
            return;
        }
        if let Err(error) = bootstrap(&shared).await {
            tracing::warn!(error = %error, "reconnect attempt failed");
        }
    });
    if scheduled {
        tracing::info!(delay_ms = delay.as_millis() as u64, "reconnect scheduled");
    }
}

fn ensure_frame_listener(inner: &Arc<AdapterShared>) {
    let mut slot = lock(&inner.listener);
    if slot.as_ref().is_some_and(|task| !task.is_finished()) {
        return;
    }
    let mut rx = inner.channel.subscribe();
    let shared = Arc::clone(inner);
    *slot = Some(tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(frame) => handle_inbound(&shared, frame),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "frame listener lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }));
}

fn handle_inbound(inner: &AdapterShared, frame: Frame) {
    lock(&inner.ownership).observe_frame(&frame);

    if let Frame::Broadcast(broadcast) = frame {
        if broadcast.method != STREAM_EVENT_METHOD {
            return;
        }
        let thread_id = broadcast
            .params
            .get("conversationId")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(thread_id) = thread_id {
            lock(&inner.buffers).push(&thread_id, broadcast);
        } else {
            tracing::debug!("stream event without a conversationId dropped");
        }
    }
}
