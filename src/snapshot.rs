//! Actor snapshots and context merging.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::Event;

/// The immutable `{value, context, event}` triple representing an actor's
/// state at an instant. A new snapshot is produced on every committed
/// transition; handing out references is safe because a snapshot is never
/// mutated after commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    /// Current state name. Always a key in the definition's state table.
    pub value: String,

    /// Current context (mutable data, replaced wholesale on each commit).
    pub context: Value,

    /// Last processed event, `None` before the first one. Skipped during
    /// serialization: externally supplied snapshots carry no event.
    #[serde(skip)]
    pub event: Option<Event>,
}

impl MachineSnapshot {
    /// Creates a snapshot with no processed event.
    pub fn new(value: impl Into<String>, context: Value) -> Self {
        Self {
            value: value.into(),
            context,
            event: None,
        }
    }
}

/// A named child's snapshot inside a recursive sync: the child's own
/// descendants nest under `children`, so one call can correct a whole
/// subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSnapshot {
    /// Spawn id of the child under its parent.
    pub id: String,

    pub snapshot: MachineSnapshot,

    /// Snapshots for the child's own named children.
    #[serde(default)]
    pub children: Vec<ChildSnapshot>,
}

impl ChildSnapshot {
    pub fn new(id: impl Into<String>, snapshot: MachineSnapshot) -> Self {
        Self {
            id: id.into(),
            snapshot,
            children: Vec::new(),
        }
    }

    /// Attaches nested child snapshots.
    pub fn with_children(mut self, children: Vec<ChildSnapshot>) -> Self {
        self.children = children;
        self
    }
}

/// Shallow-merges a partial object onto a context, returning the new
/// context. Existing keys are overwritten, others untouched. Non-object
/// operands leave the context unchanged.
pub fn merge_context(ctx: &Value, partial: &Value) -> Value {
    match (ctx, partial) {
        (Value::Object(base), Value::Object(update)) => {
            let mut merged = base.clone();
            for (k, v) in update {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        _ => ctx.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_overwrites_and_preserves() {
        let ctx = json!({"count": 1, "name": "a"});
        let merged = merge_context(&ctx, &json!({"count": 2}));
        assert_eq!(merged, json!({"count": 2, "name": "a"}));
    }

    #[test]
    fn test_merge_adds_new_keys() {
        let merged = merge_context(&json!({}), &json!({"ready": true}));
        assert_eq!(merged, json!({"ready": true}));
    }

    #[test]
    fn test_merge_ignores_non_object_partial() {
        let ctx = json!({"count": 1});
        assert_eq!(merge_context(&ctx, &json!(42)), ctx);
        assert_eq!(merge_context(&ctx, &Value::Null), ctx);
    }

    #[test]
    fn test_snapshot_serde_skips_event() {
        let mut snapshot = MachineSnapshot::new("idle", json!({"n": 1}));
        snapshot.event = Some(Event::tag_only("GO"));

        let encoded = serde_json::to_string(&snapshot).unwrap();
        let decoded: MachineSnapshot = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.value, "idle");
        assert_eq!(decoded.context, json!({"n": 1}));
        assert!(decoded.event.is_none());
    }
}
