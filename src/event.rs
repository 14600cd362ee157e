//! Event types.
//!
//! Every event carries a tag used for transition dispatch. Application
//! events are `Event::User`; the remaining variants are internal
//! pseudo-events that share the mailbox and dispatch path but are
//! intercepted before the user-defined `on` lookup.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::snapshot::{ChildSnapshot, MachineSnapshot};

/// An event processed by an actor.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// An application-defined event, dispatched via the current state's
    /// `on` table by tag.
    User { tag: String, payload: Value },

    /// Triggering event for work started on the very first entry into the
    /// initial state. Never enqueued.
    Init,

    /// Snapshot replacement from an external authority. Carries the new
    /// snapshot plus a recursive set of snapshots for named children.
    Sync {
        snapshot: Box<MachineSnapshot>,
        children: Vec<ChildSnapshot>,
    },

    /// Restart of current-state activities and delays after a pause.
    Resume,

    /// A delayed transition fired. `key` names the delay; `target` carries
    /// the originally configured target for persistent delays so the
    /// transition resolves even after the owning state was left.
    After { key: String, target: Option<String> },

    /// An invoked operation produced a value.
    InvokeSuccess { id: String, value: Value },

    /// An invoked operation failed with a typed error value.
    InvokeFailure { id: String, error: Value },

    /// An invoked operation panicked.
    InvokeDefect { id: String, message: String },

    /// An invoked operation was cancelled mid-flight.
    InvokeInterrupt { id: String },
}

impl Event {
    /// Builds an application event.
    pub fn user(tag: impl Into<String>, payload: Value) -> Self {
        Event::User {
            tag: tag.into(),
            payload,
        }
    }

    /// Builds an application event with no payload.
    pub fn tag_only(tag: impl Into<String>) -> Self {
        Event::User {
            tag: tag.into(),
            payload: Value::Null,
        }
    }

    /// The dispatch tag for this event.
    pub fn tag(&self) -> &str {
        match self {
            Event::User { tag, .. } => tag,
            Event::Init => "$init",
            Event::Sync { .. } => "$sync",
            Event::Resume => "$resume",
            Event::After { .. } => "$after",
            Event::InvokeSuccess { .. } => "$invoke.success",
            Event::InvokeFailure { .. } => "$invoke.failure",
            Event::InvokeDefect { .. } => "$invoke.defect",
            Event::InvokeInterrupt { .. } => "$invoke.interrupt",
        }
    }

    /// The payload of an application event.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Event::User { payload, .. } => Some(payload),
            _ => None,
        }
    }

    /// The invoke attempt id, for the four invoke outcome events.
    pub(crate) fn invoke_id(&self) -> Option<&str> {
        match self {
            Event::InvokeSuccess { id, .. }
            | Event::InvokeFailure { id, .. }
            | Event::InvokeDefect { id, .. }
            | Event::InvokeInterrupt { id } => Some(id),
            _ => None,
        }
    }
}

/// An externally observable event delivered through `Actor::on` listeners,
/// decoupled from the snapshot stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmittedEvent {
    /// Listener routing key.
    pub kind: String,

    /// Application-defined payload.
    pub payload: Value,
}

impl EmittedEvent {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}
