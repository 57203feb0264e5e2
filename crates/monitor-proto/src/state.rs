//! Per-thread conversation state as read back from a backend or rebuilt from
//! stream events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConversationState {
    pub id: String,
    pub turns: Vec<Turn>,
    pub requests: Vec<PendingRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_reasoning_effort: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Turn {
    pub turn_id: String,
    pub status: TurnStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    pub items: Vec<Value>,
}

/// A user-input or approval request waiting on a response. Backends attach
/// provider-specific detail; only the identity and completion flag matter
/// here, the rest rides along untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PendingRequest {
    pub id: String,
    pub completed: bool,
    #[serde(flatten)]
    pub detail: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TurnStatus {
    #[default]
    Pending,
    Running,
    InProgress,
    Completed,
    Failed,
    Error,
    Cancelled,
    Canceled,
    #[serde(untagged)]
    Other(String),
}

impl TurnStatus {
    /// Whether the turn can no longer accept steering or interruption.
    /// Comparison is case-insensitive because backends disagree on casing.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Completed | Self::Failed | Self::Error | Self::Cancelled | Self::Canceled => true,
            Self::Pending | Self::Running | Self::InProgress => false,
            Self::Other(label) => {
                let label = label.to_ascii_lowercase();
                matches!(
                    label.as_str(),
                    "completed" | "failed" | "error" | "cancelled" | "canceled"
                )
            }
        }
    }
}

impl ConversationState {
    /// Most recent turn that has not reached a terminal status, scanning from
    /// the end of the turn list.
    pub fn active_turn(&self) -> Option<&Turn> {
        self.turns.iter().rev().find(|turn| !turn.status.is_terminal())
    }
}
