// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! References to tasks and groups, and their tuple encoding.
//!
//! A reference tree is stored as nested JSON arrays:
//!
//! ```text
//! task  = [[task_id,  parent | null], null]
//! group = [[group_id, parent | null], [member, member, ...]]
//! ```
//!
//! A `null` second element marks a task reference, an array marks a
//! group. Groups may contain groups to any depth.

use serde_json::Value;

use crate::error::{CoreError, Result};

/// Reference to a single task's result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRef {
    /// Task identifier.
    pub id: String,
    /// Result this task was chained from, if any.
    pub parent: Option<Box<ResultRef>>,
}

/// Reference to a group of results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRef {
    /// Group identifier.
    pub id: String,
    /// Members in dispatch order.
    pub members: Vec<ResultRef>,
    /// Result this group was chained from, if any.
    pub parent: Option<Box<ResultRef>>,
}

/// A task or a (possibly nested) group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultRef {
    /// Leaf task reference.
    Task(TaskRef),
    /// Group of references.
    Group(GroupRef),
}

impl TaskRef {
    /// Reference to `id` without a parent.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent: None,
        }
    }
}

impl GroupRef {
    /// Group `id` with the given members and no parent.
    pub fn new(id: impl Into<String>, members: Vec<ResultRef>) -> Self {
        Self {
            id: id.into(),
            members,
            parent: None,
        }
    }
}

impl From<TaskRef> for ResultRef {
    fn from(task: TaskRef) -> Self {
        ResultRef::Task(task)
    }
}

impl From<GroupRef> for ResultRef {
    fn from(group: GroupRef) -> Self {
        ResultRef::Group(group)
    }
}

impl ResultRef {
    /// Shorthand for a parentless task reference.
    pub fn task(id: impl Into<String>) -> Self {
        ResultRef::Task(TaskRef::new(id))
    }

    /// Shorthand for a parentless group reference.
    pub fn group(id: impl Into<String>, members: Vec<ResultRef>) -> Self {
        ResultRef::Group(GroupRef::new(id, members))
    }

    /// Identifier of the referenced task or group.
    pub fn id(&self) -> &str {
        match self {
            ResultRef::Task(task) => &task.id,
            ResultRef::Group(group) => &group.id,
        }
    }

    fn parent(&self) -> Option<&ResultRef> {
        match self {
            ResultRef::Task(task) => task.parent.as_deref(),
            ResultRef::Group(group) => group.parent.as_deref(),
        }
    }

    /// Task ids of every leaf, depth first, in member order.
    pub fn leaf_task_ids(&self) -> Vec<&str> {
        let mut ids = Vec::new();
        self.collect_leaves(&mut ids);
        ids
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            ResultRef::Task(task) => out.push(&task.id),
            ResultRef::Group(group) => {
                for member in &group.members {
                    member.collect_leaves(out);
                }
            }
        }
    }

    /// Encode as the nested tuple form.
    pub fn to_tuple(&self) -> Value {
        let parent = self.parent().map_or(Value::Null, ResultRef::to_tuple);
        let head = Value::Array(vec![Value::String(self.id().to_string()), parent]);
        let nodes = match self {
            ResultRef::Task(_) => Value::Null,
            ResultRef::Group(group) => {
                Value::Array(group.members.iter().map(ResultRef::to_tuple).collect())
            }
        };
        Value::Array(vec![head, nodes])
    }

    /// Decode the nested tuple form.
    pub fn from_tuple(value: &Value) -> Result<Self> {
        let [head, nodes] = pair(value, "reference")?;
        let [id, parent] = pair(head, "reference head")?;

        let id = id
            .as_str()
            .ok_or_else(|| invalid(format!("reference id must be a string, got {id}")))?
            .to_string();
        let parent = match parent {
            Value::Null => None,
            other => Some(Box::new(ResultRef::from_tuple(other)?)),
        };

        match nodes {
            Value::Null => Ok(ResultRef::Task(TaskRef { id, parent })),
            Value::Array(items) => {
                let members = items
                    .iter()
                    .map(ResultRef::from_tuple)
                    .collect::<Result<Vec<_>>>()?;
                Ok(ResultRef::Group(GroupRef {
                    id,
                    members,
                    parent,
                }))
            }
            other => Err(invalid(format!(
                "group members must be an array or null, got {other}"
            ))),
        }
    }
}

/// Encode a member list as a JSON array of tuples.
pub fn members_to_json(members: &[ResultRef]) -> Result<String> {
    let tuples: Vec<Value> = members.iter().map(ResultRef::to_tuple).collect();
    Ok(serde_json::to_string(&tuples)?)
}

/// Decode a JSON array of tuples produced by [`members_to_json`].
pub fn members_from_json(raw: &str) -> Result<Vec<ResultRef>> {
    let value: Value = serde_json::from_str(raw)?;
    let items = value
        .as_array()
        .ok_or_else(|| invalid("member list must be a JSON array".to_string()))?;
    items.iter().map(ResultRef::from_tuple).collect()
}

fn pair<'a>(value: &'a Value, what: &str) -> Result<[&'a Value; 2]> {
    match value.as_array().map(Vec::as_slice) {
        Some([first, second]) => Ok([first, second]),
        _ => Err(invalid(format!("{what} must be a two-element array, got {value}"))),
    }
}

fn invalid(details: String) -> CoreError {
    CoreError::InvalidReference { details }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn nested_tree() -> ResultRef {
        ResultRef::group(
            "outer",
            vec![
                ResultRef::task("t1"),
                ResultRef::group(
                    "inner",
                    vec![
                        ResultRef::task("t2"),
                        ResultRef::group("innermost", vec![ResultRef::task("t3")]),
                    ],
                ),
                ResultRef::group("empty", vec![]),
            ],
        )
    }

    #[test]
    fn test_task_tuple_shape() {
        assert_eq!(ResultRef::task("t1").to_tuple(), json!([["t1", null], null]));
    }

    #[test]
    fn test_group_tuple_shape() {
        let group = ResultRef::group("g1", vec![ResultRef::task("a"), ResultRef::task("b")]);
        assert_eq!(
            group.to_tuple(),
            json!([["g1", null], [[["a", null], null], [["b", null], null]]])
        );
    }

    #[test]
    fn test_nested_round_trip() {
        let tree = nested_tree();
        assert_eq!(ResultRef::from_tuple(&tree.to_tuple()).unwrap(), tree);
    }

    #[test]
    fn test_empty_group_is_not_a_task() {
        let decoded = ResultRef::from_tuple(&json!([["g", null], []])).unwrap();
        assert!(matches!(decoded, ResultRef::Group(ref g) if g.members.is_empty()));
    }

    #[test]
    fn test_parent_round_trip() {
        let child = ResultRef::Task(TaskRef {
            id: "child".to_string(),
            parent: Some(Box::new(ResultRef::task("parent"))),
        });
        let tuple = child.to_tuple();
        assert_eq!(tuple, json!([["child", [["parent", null], null]], null]));
        assert_eq!(ResultRef::from_tuple(&tuple).unwrap(), child);
    }

    #[test]
    fn test_leaf_task_ids_in_member_order() {
        assert_eq!(nested_tree().leaf_task_ids(), vec!["t1", "t2", "t3"]);
    }

    #[test]
    fn test_members_json_round_trip() {
        let members = vec![ResultRef::task("t1"), nested_tree()];
        let raw = members_to_json(&members).unwrap();
        assert_eq!(members_from_json(&raw).unwrap(), members);
    }

    #[test]
    fn test_malformed_tuples_rejected() {
        for bad in [
            json!("t1"),
            json!([["t1", null]]),
            json!([[1, null], null]),
            json!([["g", null], "members"]),
        ] {
            let err = ResultRef::from_tuple(&bad).unwrap_err();
            assert_eq!(err.error_code(), "INVALID_REFERENCE", "input: {bad}");
        }
        assert!(members_from_json("{}").is_err());
    }
}
