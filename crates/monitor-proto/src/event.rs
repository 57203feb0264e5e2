//! Stream events: snapshot/patch broadcasts that feed the live-state reducer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::frame::BroadcastFrame;
use crate::validate::{FrameValidationError, ValidationIssue};

/// Broadcast method carrying per-thread stream changes.
pub const STREAM_EVENT_METHOD: &str = "thread/streamEvent";

/// A validated stream broadcast, ready for reduction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_client_id: Option<String>,
    pub change: StreamChange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamChange {
    #[serde(rename_all = "camelCase")]
    Snapshot { conversation_state: Value },
    #[serde(rename_all = "camelCase")]
    Patches { patches: Vec<PatchOp> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOp {
    pub op: PatchOpKind,
    pub path: Vec<PathSegment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOpKind {
    Replace,
    Add,
    Remove,
    #[serde(untagged)]
    Other(String),
}

/// One step of a patch path: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl std::fmt::Display for PathSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index(index) => write!(f, "[{index}]"),
            Self::Key(key) => write!(f, "{key}"),
        }
    }
}

impl StreamEvent {
    /// Build a synthetic snapshot event, used when replaying live events on
    /// top of the last persisted read of a thread.
    pub fn synthetic_snapshot(thread_id: impl Into<String>, conversation_state: Value) -> Self {
        Self {
            thread_id: thread_id.into(),
            source_client_id: None,
            change: StreamChange::Snapshot { conversation_state },
        }
    }

    /// Strictly validate a stream broadcast's params and decode the event.
    pub fn from_broadcast(frame: &BroadcastFrame) -> Result<Self, FrameValidationError> {
        let mut issues = Vec::new();
        let Some(params) = frame.params.as_object() else {
            return Err(FrameValidationError::single(
                "params",
                "stream event params must be an object",
            ));
        };

        let thread_id = match params.get("conversationId").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                issues.push(ValidationIssue::new(
                    "params.conversationId",
                    "missing or empty",
                ));
                String::new()
            }
        };

        let change = params.get("change").and_then(Value::as_object);
        match change {
            None => issues.push(ValidationIssue::new("params.change", "missing field")),
            Some(change) => match change.get("type").and_then(Value::as_str) {
                Some("snapshot") => {
                    if !change
                        .get("conversationState")
                        .is_some_and(Value::is_object)
                    {
                        issues.push(ValidationIssue::new(
                            "params.change.conversationState",
                            "snapshot requires an object state",
                        ));
                    }
                }
                Some("patches") => match change.get("patches").and_then(Value::as_array) {
                    None => issues.push(ValidationIssue::new(
                        "params.change.patches",
                        "patches change requires an array",
                    )),
                    Some(patches) => {
                        for (index, patch) in patches.iter().enumerate() {
                            check_patch_shape(index, patch, &mut issues);
                        }
                    }
                },
                Some(other) => issues.push(ValidationIssue::new(
                    "params.change.type",
                    format!("unknown change type '{other}'"),
                )),
                None => issues.push(ValidationIssue::new(
                    "params.change.type",
                    "missing field",
                )),
            },
        }

        if !issues.is_empty() {
            return Err(FrameValidationError::new(issues));
        }

        let change: StreamChange = serde_json::from_value(
            params.get("change").cloned().unwrap_or(Value::Null),
        )
        .map_err(|error| FrameValidationError::single("params.change", error.to_string()))?;

        Ok(Self {
            thread_id,
            source_client_id: Some(frame.source_client_id.clone()),
            change,
        })
    }
}

fn check_patch_shape(index: usize, patch: &Value, issues: &mut Vec<ValidationIssue>) {
    let prefix = format!("params.change.patches[{index}]");
    let Some(patch) = patch.as_object() else {
        issues.push(ValidationIssue::new(prefix, "patch must be an object"));
        return;
    };
    if !patch.get("op").is_some_and(Value::is_string) {
        issues.push(ValidationIssue::new(format!("{prefix}.op"), "missing op"));
    }
    match patch.get("path").and_then(Value::as_array) {
        None => issues.push(ValidationIssue::new(
            format!("{prefix}.path"),
            "path must be an array of keys and indices",
        )),
        Some(segments) => {
            for (seg_index, segment) in segments.iter().enumerate() {
                let valid = segment.is_string() || segment.as_u64().is_some();
                if !valid {
                    issues.push(ValidationIssue::new(
                        format!("{prefix}.path[{seg_index}]"),
                        "segment must be a key or an index",
                    ));
                }
            }
        }
    }
}
