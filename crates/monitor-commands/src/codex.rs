//! Codex provider plugged into the unified surface.

use async_trait::async_trait;
use monitor_codex::{
    AdapterError, CodexAdapter, LiveStateError, RpcError, SendMessageOptions, ThreadListParams,
    ThreadStartParams,
};
use serde_json::{Value, json};

use crate::backend::{
    BackendAdapter, CommandError, CommandResult, FeatureAvailability, UnavailableReason,
};
use crate::command::{CommandKind, Provider, UnifiedCommand};

pub struct CodexBackend {
    adapter: CodexAdapter,
}

impl CodexBackend {
    pub fn new(adapter: CodexAdapter) -> Self {
        Self { adapter }
    }

    pub fn adapter(&self) -> &CodexAdapter {
        &self.adapter
    }
}

/// Commands that ride the duplex channel rather than the RPC backend.
const fn needs_ipc(kind: CommandKind) -> bool {
    matches!(
        kind,
        CommandKind::SetCollaborationMode | CommandKind::SubmitUserInput
    )
}

const fn reads_stream(kind: CommandKind) -> bool {
    matches!(
        kind,
        CommandKind::ReadLiveState | CommandKind::ReadStreamEvents
    )
}

#[async_trait]
impl BackendAdapter for CodexBackend {
    fn provider(&self) -> Provider {
        Provider::Codex
    }

    fn availability(&self, kind: CommandKind) -> FeatureAvailability {
        let state = self.adapter.runtime_state();
        if !state.codex_available {
            return FeatureAvailability::Unavailable {
                reason: UnavailableReason::ProviderDisabled,
            };
        }
        if needs_ipc(kind) {
            if !state.ipc_initialized {
                return FeatureAvailability::Unavailable {
                    reason: UnavailableReason::ProviderDisconnected,
                };
            }
        } else if reads_stream(kind) {
            if !state.ipc_connected {
                return FeatureAvailability::Unavailable {
                    reason: UnavailableReason::ProviderDisconnected,
                };
            }
        } else if !state.app_ready {
            return FeatureAvailability::Unavailable {
                reason: UnavailableReason::ProviderNotReady,
            };
        }
        FeatureAvailability::Available
    }

    async fn execute(&self, command: UnifiedCommand) -> Result<CommandResult, CommandError> {
        match command {
            UnifiedCommand::ListThreads { cursor, limit, .. } => {
                let response = self
                    .adapter
                    .list_threads(ThreadListParams {
                        cursor,
                        limit,
                        cwd: None,
                    })
                    .await
                    .map_err(normalize_error)?;
                Ok(CommandResult::ListThreads {
                    threads: response.data,
                    next_cursor: response.next_cursor,
                })
            }
            UnifiedCommand::CreateThread { model, cwd, .. } => {
                let thread = self
                    .adapter
                    .create_thread(ThreadStartParams { model, cwd })
                    .await
                    .map_err(normalize_error)?;
                Ok(CommandResult::CreateThread { thread })
            }
            UnifiedCommand::ReadThread { thread_id, .. } => {
                let thread = self
                    .adapter
                    .read_thread(&thread_id)
                    .await
                    .map_err(normalize_error)?;
                Ok(CommandResult::ReadThread { thread })
            }
            UnifiedCommand::SendMessage {
                thread_id,
                text,
                model,
                effort,
                ..
            } => {
                let response = self
                    .adapter
                    .send_message(&thread_id, &text, SendMessageOptions { model, effort })
                    .await
                    .map_err(normalize_error)?;
                Ok(CommandResult::SendMessage {
                    turn_id: response.turn.id,
                })
            }
            UnifiedCommand::Interrupt { thread_id, .. } => {
                let interrupted_turn_id = self
                    .adapter
                    .interrupt(&thread_id)
                    .await
                    .map_err(normalize_error)?;
                Ok(CommandResult::Interrupt {
                    interrupted_turn_id,
                })
            }
            UnifiedCommand::ListModels { .. } => {
                let response = self.adapter.list_models().await.map_err(normalize_error)?;
                Ok(CommandResult::ListModels {
                    models: response.data,
                })
            }
            UnifiedCommand::ListCollaborationModes { .. } => {
                let response = self
                    .adapter
                    .list_collaboration_modes()
                    .await
                    .map_err(normalize_error)?;
                Ok(CommandResult::ListCollaborationModes {
                    modes: response.data,
                })
            }
            UnifiedCommand::SetCollaborationMode {
                thread_id,
                mode,
                owner_client_id,
                ..
            } => {
                let result = self
                    .adapter
                    .set_collaboration_mode(&thread_id, &mode, owner_client_id.as_deref())
                    .await
                    .map_err(normalize_error)?;
                Ok(CommandResult::SetCollaborationMode { result })
            }
            UnifiedCommand::SubmitUserInput {
                thread_id,
                request_id,
                response,
                owner_client_id,
                ..
            } => {
                let result = self
                    .adapter
                    .submit_user_input(&thread_id, &request_id, response, owner_client_id.as_deref())
                    .await
                    .map_err(normalize_error)?;
                Ok(CommandResult::SubmitUserInput { result })
            }
            UnifiedCommand::ReadLiveState { thread_id, .. } => {
                let live = self.adapter.read_live_state(&thread_id);
                Ok(CommandResult::ReadLiveState {
                    conversation_state: live.conversation_state,
                    owner_client_id: live.owner_client_id,
                    live_state_error: live.live_state_error.as_ref().map(live_error_value),
                })
            }
            UnifiedCommand::ReadStreamEvents { thread_id, .. } => {
                Ok(CommandResult::ReadStreamEvents {
                    events: self.adapter.read_stream_events(&thread_id),
                })
            }
            UnifiedCommand::ListProjectDirectories { .. } => {
                let directories = self
                    .adapter
                    .list_project_directories()
                    .await
                    .map_err(normalize_error)?;
                Ok(CommandResult::ListProjectDirectories { directories })
            }
        }
    }
}

fn live_error_value(error: &LiveStateError) -> Value {
    let LiveStateError::ReductionFailed(failure) = error;
    json!({
        "kind": "reductionFailed",
        "message": failure.message,
        "threadId": failure.thread_id,
        "eventIndex": failure.event_index,
        "patchIndex": failure.patch_index,
    })
}

fn normalize_error(error: AdapterError) -> CommandError {
    match error {
        AdapterError::Rpc(RpcError::Backend { code, message }) => {
            CommandError::with_details("backendError", message, json!({"code": code}))
        }
        AdapterError::Rpc(RpcError::ExecutableNotFound) => {
            CommandError::new("backendUnavailable", RpcError::ExecutableNotFound.to_string())
        }
        AdapterError::Rpc(error @ RpcError::Timeout { .. }) => {
            CommandError::new("timeout", error.to_string())
        }
        AdapterError::Rpc(error) => CommandError::new("transportError", error.to_string()),
        AdapterError::Channel(error) => CommandError::new("ipcError", error.to_string()),
        AdapterError::Ownership(error) => CommandError::new("ownerUnknown", error.to_string()),
        AdapterError::NoActiveTurn { thread_id } => CommandError::with_details(
            "noActiveTurn",
            format!("no active turn for thread {thread_id}"),
            json!({"threadId": thread_id}),
        ),
        AdapterError::BackendUnavailable(message) => {
            CommandError::new("backendUnavailable", message)
        }
        AdapterError::Stopped => CommandError::new("adapterStopped", "adapter is stopped"),
    }
}
