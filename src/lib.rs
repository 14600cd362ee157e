//! # stator
//!
//! An actor-style state machine interpreter.
//!
//! This crate provides:
//! - Fluent machine definitions with validation at build time
//! - Guarded transitions with entry/exit actions and shallow context merging
//! - State-scoped background work: activities, invoked operations, delayed
//!   transitions, all genuinely cancelled when their state is left
//! - Actor hierarchies: spawn, stop, send-to-child, send-to-parent, forward
//! - Snapshot sync with an external authority, pause/resume, `wait_for`
//!
//! A machine definition is immutable and shareable; `interpret` turns it
//! into a live [`Actor`] driven by a FIFO mailbox. All event processing is
//! serialized per actor, so actions never observe a half-applied context.
//!
//! ```ignore
//! use serde_json::json;
//! use stator::{interpret, Event, MachineDefinition, StateNode, Transition};
//!
//! let def = MachineDefinition::builder("order")
//!     .initial("created")
//!     .context(json!({"total": 0}))
//!     .state("created", StateNode::new().on("PAY", Transition::to("paid")))
//!     .state("paid", StateNode::new())
//!     .build()?;
//!
//! let actor = interpret(std::sync::Arc::new(def))?;
//! actor.send(Event::tag_only("PAY"));
//! assert_eq!(actor.snapshot().value, "paid");
//! ```

pub mod action;
pub mod actor;
pub mod definition;
pub mod error;
pub mod event;
pub mod guard;
mod mailbox;
pub mod snapshot;
mod work;

pub use action::{
    assign, assign_partial, cancel, cancel_with, effect, emit, emit_with, enqueue_actions,
    forward_to, forward_to_with, raise, raise_with, send_parent, send_parent_with, send_to,
    send_to_with, spawn_child, spawn_child_with, stop_child, stop_child_with, Action,
    ActionCollector, Dynamic,
};
pub use actor::{interpret, interpret_on, Actor, EventSender, Subscription};
pub use definition::{
    Activity, ActivityArgs, DelaySpec, Invoke, MachineDefinition, MachineDefinitionBuilder,
    StateNode, Transition,
};
pub use error::MachineError;
pub use event::{EmittedEvent, Event};
pub use guard::Guard;
pub use snapshot::{merge_context, ChildSnapshot, MachineSnapshot};
