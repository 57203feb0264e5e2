//! Strict validation support for payloads crossing the channel boundary.

use serde_json::Value;
use thiserror::Error;

/// How many issues are spelled out before the rest collapse into a count.
const ISSUE_DISPLAY_LIMIT: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// A payload failed strict validation. Carries every issue found, but renders
/// only the first few so log lines stay bounded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid payload: {}", self.summary())]
pub struct FrameValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl FrameValidationError {
    pub fn new(issues: Vec<ValidationIssue>) -> Self {
        Self { issues }
    }

    pub fn single(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            issues: vec![ValidationIssue::new(path, message)],
        }
    }

    pub fn summary(&self) -> String {
        let mut parts: Vec<String> = self
            .issues
            .iter()
            .take(ISSUE_DISPLAY_LIMIT)
            .map(|issue| {
                if issue.path.is_empty() {
                    issue.message.clone()
                } else {
                    format!("{}: {}", issue.path, issue.message)
                }
            })
            .collect();
        if self.issues.len() > ISSUE_DISPLAY_LIMIT {
            parts.push(format!(
                "(+{} more)",
                self.issues.len() - ISSUE_DISPLAY_LIMIT
            ));
        }
        parts.join("; ")
    }
}

/// Shape constraints a single field must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FieldKind {
    UnsignedInt,
    Str,
    Object,
    Any,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    pub const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

/// Check `object` against a closed field list, collecting issues into `issues`.
/// `prefix` scopes issue paths for nested objects.
pub(crate) fn check_fields(
    object: &serde_json::Map<String, Value>,
    specs: &[FieldSpec],
    skip: &[&str],
    prefix: &str,
    issues: &mut Vec<ValidationIssue>,
) {
    let path_of = |name: &str| {
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}.{name}")
        }
    };

    for spec in specs {
        match object.get(spec.name) {
            None | Some(Value::Null) => {
                if spec.required {
                    issues.push(ValidationIssue::new(path_of(spec.name), "missing field"));
                }
            }
            Some(value) => {
                let ok = match spec.kind {
                    FieldKind::UnsignedInt => value.as_u64().is_some(),
                    FieldKind::Str => value.is_string(),
                    FieldKind::Object => value.is_object(),
                    FieldKind::Any => true,
                };
                if !ok {
                    issues.push(ValidationIssue::new(
                        path_of(spec.name),
                        format!("expected {}", kind_label(spec.kind)),
                    ));
                }
            }
        }
    }

    for key in object.keys() {
        let known = skip.contains(&key.as_str()) || specs.iter().any(|spec| spec.name == key);
        if !known {
            issues.push(ValidationIssue::new(path_of(key), "unknown field"));
        }
    }
}

fn kind_label(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::UnsignedInt => "an unsigned integer",
        FieldKind::Str => "a string",
        FieldKind::Object => "an object",
        FieldKind::Any => "a value",
    }
}
