//! Tree navigation for patch application: an ordered key/index path into a
//! JSON value, mutated in place.

use monitor_proto::{PatchOp, PatchOpKind, PathSegment};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("patch path is empty")]
    EmptyPath,
    #[error("unsupported patch op '{op}'")]
    UnsupportedOp { op: String },
    #[error("patch op '{op}' requires a value")]
    MissingValue { op: String },
    #[error("path segment '{segment}' not found")]
    PathNotFound { segment: String },
    #[error("cannot descend into a leaf at segment '{segment}'")]
    NotAContainer { segment: String },
    #[error("index {index} out of bounds for array of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
}

/// Apply one operation. Supported ops: `replace`, `add`, `remove`; anything
/// else is an explicit error, never a silent skip.
pub fn apply_patch(root: &mut Value, patch: &PatchOp) -> Result<(), PatchError> {
    let op_name = match &patch.op {
        PatchOpKind::Replace => "replace",
        PatchOpKind::Add => "add",
        PatchOpKind::Remove => "remove",
        PatchOpKind::Other(op) => {
            return Err(PatchError::UnsupportedOp { op: op.clone() });
        }
    };

    let Some((last, parents)) = patch.path.split_last() else {
        return Err(PatchError::EmptyPath);
    };

    let mut target = root;
    for segment in parents {
        target = descend(target, segment)?;
    }

    match patch.op {
        PatchOpKind::Replace => {
            let value = required_value(patch, op_name)?;
            let slot = descend(target, last)?;
            *slot = value;
        }
        PatchOpKind::Add => {
            let value = required_value(patch, op_name)?;
            insert(target, last, value)?;
        }
        PatchOpKind::Remove => remove(target, last)?,
        PatchOpKind::Other(_) => {}
    }
    Ok(())
}

fn required_value(patch: &PatchOp, op: &str) -> Result<Value, PatchError> {
    patch
        .value
        .clone()
        .ok_or_else(|| PatchError::MissingValue { op: op.to_string() })
}

fn descend<'a>(target: &'a mut Value, segment: &PathSegment) -> Result<&'a mut Value, PatchError> {
    match (target, segment) {
        (Value::Object(map), PathSegment::Key(key)) => {
            map.get_mut(key).ok_or_else(|| PatchError::PathNotFound {
                segment: key.clone(),
            })
        }
        (Value::Array(items), PathSegment::Index(index)) => {
            let len = items.len();
            items
                .get_mut(*index)
                .ok_or(PatchError::IndexOutOfBounds { index: *index, len })
        }
        (_, segment) => Err(PatchError::NotAContainer {
            segment: segment.to_string(),
        }),
    }
}

fn insert(target: &mut Value, segment: &PathSegment, value: Value) -> Result<(), PatchError> {
    match (target, segment) {
        (Value::Object(map), PathSegment::Key(key)) => {
            map.insert(key.clone(), value);
            Ok(())
        }
        (Value::Array(items), PathSegment::Index(index)) => {
            let len = items.len();
            if *index > len {
                return Err(PatchError::IndexOutOfBounds { index: *index, len });
            }
            items.insert(*index, value);
            Ok(())
        }
        (_, segment) => Err(PatchError::NotAContainer {
            segment: segment.to_string(),
        }),
    }
}

fn remove(target: &mut Value, segment: &PathSegment) -> Result<(), PatchError> {
    match (target, segment) {
        (Value::Object(map), PathSegment::Key(key)) => map
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| PatchError::PathNotFound {
                segment: key.clone(),
            }),
        (Value::Array(items), PathSegment::Index(index)) => {
            let len = items.len();
            if *index >= len {
                return Err(PatchError::IndexOutOfBounds { index: *index, len });
            }
            items.remove(*index);
            Ok(())
        }
        (_, segment) => Err(PatchError::NotAContainer {
            segment: segment.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(name: &str) -> PathSegment {
        PathSegment::Key(name.to_string())
    }

    fn patch(op: PatchOpKind, path: Vec<PathSegment>, value: Option<Value>) -> PatchOp {
        PatchOp { op, path, value }
    }

    #[test]
    fn replace_rewrites_a_nested_field() {
        let mut state = json!({"turns": [{"turnId": "t1", "status": "inProgress"}]});
        apply_patch(
            &mut state,
            &patch(
                PatchOpKind::Replace,
                vec![key("turns"), PathSegment::Index(0), key("status")],
                Some(json!("completed")),
            ),
        )
        .expect("replace");
        assert_eq!(
            state.pointer("/turns/0/status"),
            Some(&json!("completed"))
        );
    }

    #[test]
    fn add_appends_to_an_array_and_inserts_into_an_object() {
        let mut state = json!({"turns": []});
        apply_patch(
            &mut state,
            &patch(
                PatchOpKind::Add,
                vec![key("turns"), PathSegment::Index(0)],
                Some(json!({"turnId": "t1"})),
            ),
        )
        .expect("array add");
        apply_patch(
            &mut state,
            &patch(PatchOpKind::Add, vec![key("title")], Some(json!("renamed"))),
        )
        .expect("object add");
        assert_eq!(state.pointer("/turns/0/turnId"), Some(&json!("t1")));
        assert_eq!(state.get("title"), Some(&json!("renamed")));
    }

    #[test]
    fn remove_deletes_keys_and_indices() {
        let mut state = json!({"requests": [{"id": "r1"}], "title": "x"});
        apply_patch(
            &mut state,
            &patch(
                PatchOpKind::Remove,
                vec![key("requests"), PathSegment::Index(0)],
                None,
            ),
        )
        .expect("array remove");
        apply_patch(
            &mut state,
            &patch(PatchOpKind::Remove, vec![key("title")], None),
        )
        .expect("object remove");
        assert_eq!(state, json!({"requests": []}));
    }

    #[test]
    fn replace_on_a_missing_key_fails() {
        let mut state = json!({"turns": []});
        let error = apply_patch(
            &mut state,
            &patch(PatchOpKind::Replace, vec![key("title")], Some(json!("x"))),
        )
        .expect_err("missing key");
        assert_eq!(
            error,
            PatchError::PathNotFound {
                segment: "title".to_string()
            }
        );
    }

    #[test]
    fn unsupported_ops_error_explicitly() {
        let mut state = json!({});
        let error = apply_patch(
            &mut state,
            &patch(
                PatchOpKind::Other("test".to_string()),
                vec![key("title")],
                Some(json!("x")),
            ),
        )
        .expect_err("unsupported op");
        assert_eq!(
            error,
            PatchError::UnsupportedOp {
                op: "test".to_string()
            }
        );
    }

    #[test]
    fn indexing_a_leaf_fails() {
        let mut state = json!({"title": "x"});
        let error = apply_patch(
            &mut state,
            &patch(
                PatchOpKind::Replace,
                vec![key("title"), PathSegment::Index(0)],
                Some(json!("y")),
            ),
        )
        .expect_err("leaf descent");
        assert!(matches!(error, PatchError::NotAContainer { .. }));
    }

    #[test]
    fn out_of_bounds_index_fails() {
        let mut state = json!({"turns": []});
        let error = apply_patch(
            &mut state,
            &patch(
                PatchOpKind::Replace,
                vec![key("turns"), PathSegment::Index(3)],
                Some(json!({})),
            ),
        )
        .expect_err("out of bounds");
        assert_eq!(
            error,
            PatchError::IndexOutOfBounds { index: 3, len: 0 }
        );
    }
}
