//! The provider-agnostic command enumeration consumed by the UI.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Provider {
    Codex,
    Opencode,
}

impl Provider {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::Opencode => "opencode",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandKind {
    ListThreads,
    CreateThread,
    ReadThread,
    SendMessage,
    Interrupt,
    ListModels,
    ListCollaborationModes,
    SetCollaborationMode,
    SubmitUserInput,
    ReadLiveState,
    ReadStreamEvents,
    ListProjectDirectories,
}

impl CommandKind {
    pub const ALL: [Self; 12] = [
        Self::ListThreads,
        Self::CreateThread,
        Self::ReadThread,
        Self::SendMessage,
        Self::Interrupt,
        Self::ListModels,
        Self::ListCollaborationModes,
        Self::SetCollaborationMode,
        Self::SubmitUserInput,
        Self::ReadLiveState,
        Self::ReadStreamEvents,
        Self::ListProjectDirectories,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ListThreads => "listThreads",
            Self::CreateThread => "createThread",
            Self::ReadThread => "readThread",
            Self::SendMessage => "sendMessage",
            Self::Interrupt => "interrupt",
            Self::ListModels => "listModels",
            Self::ListCollaborationModes => "listCollaborationModes",
            Self::SetCollaborationMode => "setCollaborationMode",
            Self::SubmitUserInput => "submitUserInput",
            Self::ReadLiveState => "readLiveState",
            Self::ReadStreamEvents => "readStreamEvents",
            Self::ListProjectDirectories => "listProjectDirectories",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum UnifiedCommand {
    #[serde(rename_all = "camelCase")]
    ListThreads {
        provider: Provider,
        #[serde(default)]
        cursor: Option<String>,
        #[serde(default)]
        limit: Option<u32>,
    },
    #[serde(rename_all = "camelCase")]
    CreateThread {
        provider: Provider,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        cwd: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ReadThread {
        provider: Provider,
        thread_id: String,
    },
    #[serde(rename_all = "camelCase")]
    SendMessage {
        provider: Provider,
        thread_id: String,
        text: String,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        effort: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Interrupt {
        provider: Provider,
        thread_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ListModels { provider: Provider },
    #[serde(rename_all = "camelCase")]
    ListCollaborationModes { provider: Provider },
    #[serde(rename_all = "camelCase")]
    SetCollaborationMode {
        provider: Provider,
        thread_id: String,
        mode: String,
        #[serde(default)]
        owner_client_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SubmitUserInput {
        provider: Provider,
        thread_id: String,
        request_id: String,
        response: Value,
        #[serde(default)]
        owner_client_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ReadLiveState {
        provider: Provider,
        thread_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ReadStreamEvents {
        provider: Provider,
        thread_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ListProjectDirectories { provider: Provider },
}

impl UnifiedCommand {
    pub const fn kind(&self) -> CommandKind {
        match self {
            Self::ListThreads { .. } => CommandKind::ListThreads,
            Self::CreateThread { .. } => CommandKind::CreateThread,
            Self::ReadThread { .. } => CommandKind::ReadThread,
            Self::SendMessage { .. } => CommandKind::SendMessage,
            Self::Interrupt { .. } => CommandKind::Interrupt,
            Self::ListModels { .. } => CommandKind::ListModels,
            Self::ListCollaborationModes { .. } => CommandKind::ListCollaborationModes,
            Self::SetCollaborationMode { .. } => CommandKind::SetCollaborationMode,
            Self::SubmitUserInput { .. } => CommandKind::SubmitUserInput,
            Self::ReadLiveState { .. } => CommandKind::ReadLiveState,
            Self::ReadStreamEvents { .. } => CommandKind::ReadStreamEvents,
            Self::ListProjectDirectories { .. } => CommandKind::ListProjectDirectories,
        }
    }

    pub const fn provider(&self) -> Provider {
        match self {
            Self::ListThreads { provider, .. }
            | Self::CreateThread { provider, .. }
            | Self::ReadThread { provider, .. }
            | Self::SendMessage { provider, .. }
            | Self::Interrupt { provider, .. }
            | Self::ListModels { provider }
            | Self::ListCollaborationModes { provider }
            | Self::SetCollaborationMode { provider, .. }
            | Self::SubmitUserInput { provider, .. }
            | Self::ReadLiveState { provider, .. }
            | Self::ReadStreamEvents { provider, .. }
            | Self::ListProjectDirectories { provider } => *provider,
        }
    }
}
