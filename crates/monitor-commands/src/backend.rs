//! The seam between unified dispatch and a concrete provider backend.

use async_trait::async_trait;
use monitor_codex::{CollaborationMode, ModelInfo, ThreadSummary};
use monitor_proto::{BroadcastFrame, ConversationState};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::command::{CommandKind, Provider, UnifiedCommand};

/// Why a feature cannot be routed to a provider right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum UnavailableReason {
    UnsupportedByProvider,
    ProviderDisabled,
    ProviderDisconnected,
    ProviderNotReady,
}

impl UnavailableReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnsupportedByProvider => "unsupportedByProvider",
            Self::ProviderDisabled => "providerDisabled",
            Self::ProviderDisconnected => "providerDisconnected",
            Self::ProviderNotReady => "providerNotReady",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum FeatureAvailability {
    Available,
    Unavailable { reason: UnavailableReason },
}

/// Normalized error shape; the UI never needs backend-specific handling.
#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("{code}: {message}")]
pub struct CommandError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl CommandError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: Value,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: Some(details),
        }
    }
}

/// Success payloads, tagged so the UI can switch on `result.kind`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CommandResult {
    #[serde(rename_all = "camelCase")]
    ListThreads {
        threads: Vec<ThreadSummary>,
        #[serde(skip_serializing_if = "Option::is_none")]
        next_cursor: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CreateThread { thread: ConversationState },
    #[serde(rename_all = "camelCase")]
    ReadThread { thread: ConversationState },
    #[serde(rename_all = "camelCase")]
    SendMessage { turn_id: String },
    #[serde(rename_all = "camelCase")]
    Interrupt {
        #[serde(skip_serializing_if = "Option::is_none")]
        interrupted_turn_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ListModels { models: Vec<ModelInfo> },
    #[serde(rename_all = "camelCase")]
    ListCollaborationModes { modes: Vec<CollaborationMode> },
    #[serde(rename_all = "camelCase")]
    SetCollaborationMode { result: Value },
    #[serde(rename_all = "camelCase")]
    SubmitUserInput { result: Value },
    #[serde(rename_all = "camelCase")]
    ReadLiveState {
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_state: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        owner_client_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        live_state_error: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    ReadStreamEvents { events: Vec<BroadcastFrame> },
    #[serde(rename_all = "camelCase")]
    ListProjectDirectories { directories: Vec<String> },
}

/// One provider backend. Availability must be computed fresh per call from
/// live connectivity plus static capability flags, never cached.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn provider(&self) -> Provider;
    fn availability(&self, kind: CommandKind) -> FeatureAvailability;
    async fn execute(&self, command: UnifiedCommand) -> Result<CommandResult, CommandError>;
}
