//! Error types for the interpreter.
//!
//! Nothing in the interpreter ever throws out of `send`: definition problems
//! surface when building, and runtime failures (effects, activities, guard
//! panics) are delivered to `on_error` handlers registered on the actor.

use thiserror::Error;

/// Errors produced by the machine interpreter.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("invalid machine definition: {reason}")]
    InvalidDefinition { reason: String },

    /// `interpret` was called outside a tokio runtime. Use `interpret_on`
    /// with an explicit handle instead.
    #[error("no tokio runtime available to interpret the machine")]
    NoRuntime,

    /// A deferred effect action failed after the transition committed.
    #[error("effect action failed: {source}")]
    EffectFailed {
        #[source]
        source: anyhow::Error,
    },

    /// An activity failed on its own. Isolated per activity: siblings keep
    /// running and the snapshot is untouched.
    #[error("activity '{id}' failed: {source}")]
    ActivityFailed {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    /// A guard predicate panicked. The transition is blocked and the event
    /// dropped; the panic message is preserved here.
    #[error("guard panicked in state '{state}' on '{event}': {message}")]
    GuardPanicked {
        state: String,
        event: String,
        message: String,
    },
}

impl MachineError {
    pub(crate) fn invalid_definition(reason: impl Into<String>) -> Self {
        MachineError::InvalidDefinition {
            reason: reason.into(),
        }
    }
}
