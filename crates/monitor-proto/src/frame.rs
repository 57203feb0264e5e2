//! Discriminated frame union for the duplex IPC channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::validate::{FieldKind, FieldSpec, FrameValidationError, ValidationIssue, check_fields};

/// Protocol version stamped on outbound request/broadcast frames.
pub const PROTOCOL_VERSION: &str = "1";

/// Every message crossing the duplex channel is exactly one of these shapes.
/// Unknown `type` tags and unknown fields are hard validation failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    Request(RequestFrame),
    Response(ResponseFrame),
    Broadcast(BroadcastFrame),
    Initialize(InitializeFrame),
    InitializeResponse(InitializeResponseFrame),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFrame {
    pub request_id: u64,
    pub method: String,
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_client_id: Option<String>,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFrame {
    pub request_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastFrame {
    pub method: String,
    pub params: Value,
    pub source_client_id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_client_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeFrame {
    pub request_id: u64,
    pub params: InitializeParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub client_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,
    pub user_agent: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResponseFrame {
    pub request_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

const REQUEST_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("requestId", FieldKind::UnsignedInt),
    FieldSpec::required("method", FieldKind::Str),
    FieldSpec::required("params", FieldKind::Any),
    FieldSpec::optional("sourceClientId", FieldKind::Str),
    FieldSpec::optional("targetClientId", FieldKind::Str),
    FieldSpec::required("version", FieldKind::Str),
];

const RESPONSE_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("requestId", FieldKind::UnsignedInt),
    FieldSpec::optional("method", FieldKind::Str),
    FieldSpec::optional("result", FieldKind::Any),
    FieldSpec::optional("error", FieldKind::Any),
];

const BROADCAST_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("method", FieldKind::Str),
    FieldSpec::required("params", FieldKind::Any),
    FieldSpec::required("sourceClientId", FieldKind::Str),
    FieldSpec::required("version", FieldKind::Str),
    FieldSpec::optional("targetClientId", FieldKind::Str),
];

const INITIALIZE_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("requestId", FieldKind::UnsignedInt),
    FieldSpec::required("params", FieldKind::Object),
];

const INITIALIZE_PARAMS_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("clientName", FieldKind::Str),
    FieldSpec::optional("clientVersion", FieldKind::Str),
    FieldSpec::required("userAgent", FieldKind::Str),
];

const INITIALIZE_RESPONSE_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("requestId", FieldKind::UnsignedInt),
    FieldSpec::optional("result", FieldKind::Any),
];

impl Frame {
    /// Strictly validate a raw payload and decode it into a frame.
    ///
    /// Closed shapes reject unknown fields; the error lists every issue found
    /// rather than stopping at the first.
    pub fn validate(value: &Value) -> Result<Self, FrameValidationError> {
        let Some(object) = value.as_object() else {
            return Err(FrameValidationError::single("", "frame must be an object"));
        };

        let Some(tag) = object.get("type").and_then(Value::as_str) else {
            return Err(FrameValidationError::single(
                "type",
                "missing or non-string frame tag",
            ));
        };

        let mut issues = Vec::new();
        match tag {
            "request" => check_fields(object, REQUEST_FIELDS, &["type"], "", &mut issues),
            "response" => check_fields(object, RESPONSE_FIELDS, &["type"], "", &mut issues),
            "broadcast" => check_fields(object, BROADCAST_FIELDS, &["type"], "", &mut issues),
            "initialize" => {
                check_fields(object, INITIALIZE_FIELDS, &["type"], "", &mut issues);
                if let Some(params) = object.get("params").and_then(Value::as_object) {
                    check_fields(params, INITIALIZE_PARAMS_FIELDS, &[], "params", &mut issues);
                }
            }
            "initialize-response" => {
                check_fields(object, INITIALIZE_RESPONSE_FIELDS, &["type"], "", &mut issues);
            }
            other => {
                return Err(FrameValidationError::single(
                    "type",
                    format!("unknown frame tag '{other}'"),
                ));
            }
        }

        if !issues.is_empty() {
            return Err(FrameValidationError::new(issues));
        }

        serde_json::from_value(value.clone()).map_err(|error| {
            FrameValidationError::new(vec![ValidationIssue::new("", error.to_string())])
        })
    }

    /// Request id this frame answers, for response-shaped frames only.
    pub fn correlation_id(&self) -> Option<u64> {
        match self {
            Self::Response(response) => Some(response.request_id),
            Self::InitializeResponse(response) => Some(response.request_id),
            Self::Request(_) | Self::Broadcast(_) | Self::Initialize(_) => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(frame) => Some(&frame.method),
            Self::Broadcast(frame) => Some(&frame.method),
            Self::Response(frame) => frame.method.as_deref(),
            Self::Initialize(_) | Self::InitializeResponse(_) => None,
        }
    }

    /// Originating client, where the frame shape carries one.
    pub fn source_client_id(&self) -> Option<&str> {
        match self {
            Self::Request(frame) => frame.source_client_id.as_deref(),
            Self::Broadcast(frame) => Some(&frame.source_client_id),
            Self::Response(_) | Self::Initialize(_) | Self::InitializeResponse(_) => None,
        }
    }

    pub fn params(&self) -> Option<&Value> {
        match self {
            Self::Request(frame) => Some(&frame.params),
            Self::Broadcast(frame) => Some(&frame.params),
            Self::Response(_) | Self::Initialize(_) | Self::InitializeResponse(_) => None,
        }
    }
}
