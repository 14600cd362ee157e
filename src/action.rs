//! Transition actions.
//!
//! Actions are the effectful half of a transition. Context mutation
//! (`assign`) and event plumbing (`raise`, `cancel`, `emit`, hierarchy
//! actions) run synchronously in list order; genuinely asynchronous work
//! (`effect`) is deferred until the whole transition has committed, so it
//! always observes the final post-transition context.
//!
//! Fields that accept "a value or a function of {context, event}" are
//! modeled uniformly as [`Dynamic`], avoiding runtime type inspection.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::definition::MachineDefinition;
use crate::event::{EmittedEvent, Event};

/// A deferred, fallible side effect. Invoked at flush time with the
/// committed post-transition context and the triggering event.
pub type EffectFn =
    Arc<dyn Fn(&Value, &Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

type CollectFn = Arc<dyn Fn(&Value, &Event, &mut ActionCollector) + Send + Sync>;

/// Either a static value or a function of `{context, event}`, resolved at
/// action-execution time.
pub enum Dynamic<T> {
    Static(T),
    Computed(Arc<dyn Fn(&Value, &Event) -> T + Send + Sync>),
}

impl<T: Clone> Dynamic<T> {
    pub fn of(value: T) -> Self {
        Dynamic::Static(value)
    }

    pub fn from_fn(f: impl Fn(&Value, &Event) -> T + Send + Sync + 'static) -> Self {
        Dynamic::Computed(Arc::new(f))
    }

    pub fn resolve(&self, ctx: &Value, event: &Event) -> T {
        match self {
            Dynamic::Static(value) => value.clone(),
            Dynamic::Computed(f) => f(ctx, event),
        }
    }
}

impl<T: Clone> Clone for Dynamic<T> {
    fn clone(&self) -> Self {
        match self {
            Dynamic::Static(value) => Dynamic::Static(value.clone()),
            Dynamic::Computed(f) => Dynamic::Computed(f.clone()),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Dynamic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dynamic::Static(value) => write!(f, "Static({value:?})"),
            Dynamic::Computed(_) => f.write_str("Computed(<fn>)"),
        }
    }
}

impl From<&str> for Dynamic<String> {
    fn from(s: &str) -> Self {
        Dynamic::Static(s.to_string())
    }
}

impl From<String> for Dynamic<String> {
    fn from(s: String) -> Self {
        Dynamic::Static(s)
    }
}

/// A single transition action.
#[derive(Clone)]
pub enum Action {
    /// Shallow-merge a partial object onto the context.
    Assign(Dynamic<Value>),
    /// Deferred asynchronous side effect (flushed after commit).
    Effect(EffectFn),
    /// Enqueue an event onto the actor's own mailbox.
    Raise(Dynamic<Event>),
    /// Cancel a pending delayed transition by id.
    Cancel(Dynamic<String>),
    /// Synchronously deliver an event to external `on` listeners.
    Emit(Dynamic<EmittedEvent>),
    /// Runtime-conditional action composition: the collector function
    /// enqueues further actions which run immediately, in order.
    EnqueueActions(CollectFn),
    /// Spawn a child actor under the given id (no-op if taken).
    SpawnChild {
        definition: Arc<MachineDefinition>,
        id: Dynamic<String>,
    },
    /// Stop and remove the named child (no-op if absent).
    StopChild(Dynamic<String>),
    /// Deliver an event to the named child's mailbox (no-op if absent).
    SendTo {
        target: Dynamic<String>,
        event: Dynamic<Event>,
    },
    /// Deliver an event to the parent actor (no-op at the root).
    SendParent(Dynamic<Event>),
    /// Deliver the currently processing event, unchanged, to the named
    /// child.
    ForwardTo(Dynamic<String>),
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Assign(_) => "Assign",
            Action::Effect(_) => "Effect",
            Action::Raise(_) => "Raise",
            Action::Cancel(_) => "Cancel",
            Action::Emit(_) => "Emit",
            Action::EnqueueActions(_) => "EnqueueActions",
            Action::SpawnChild { .. } => "SpawnChild",
            Action::StopChild(_) => "StopChild",
            Action::SendTo { .. } => "SendTo",
            Action::SendParent(_) => "SendParent",
            Action::ForwardTo(_) => "ForwardTo",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Constructors
// =============================================================================

/// Context update computed from `{context, event}`. The returned partial
/// object is shallow-merged onto the context.
pub fn assign(f: impl Fn(&Value, &Event) -> Value + Send + Sync + 'static) -> Action {
    Action::Assign(Dynamic::from_fn(f))
}

/// Context update from a static partial object.
pub fn assign_partial(partial: Value) -> Action {
    Action::Assign(Dynamic::Static(partial))
}

/// Deferred asynchronous side effect. Failures are reported through
/// `on_error`, never into the transition.
pub fn effect<F, Fut>(f: F) -> Action
where
    F: Fn(&Value, &Event) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Action::Effect(Arc::new(move |ctx, event| f(ctx, event).boxed()))
}

/// Enqueue a static event onto the actor's own mailbox.
pub fn raise(event: Event) -> Action {
    Action::Raise(Dynamic::Static(event))
}

/// Enqueue an event computed from `{context, event}`.
pub fn raise_with(f: impl Fn(&Value, &Event) -> Event + Send + Sync + 'static) -> Action {
    Action::Raise(Dynamic::from_fn(f))
}

/// Cancel the pending delayed transition registered under `id`.
pub fn cancel(id: impl Into<String>) -> Action {
    Action::Cancel(Dynamic::Static(id.into()))
}

/// Cancel a delayed transition whose id is computed at execution time.
pub fn cancel_with(f: impl Fn(&Value, &Event) -> String + Send + Sync + 'static) -> Action {
    Action::Cancel(Dynamic::from_fn(f))
}

/// Notify external `on` listeners with a static event.
pub fn emit(event: EmittedEvent) -> Action {
    Action::Emit(Dynamic::Static(event))
}

/// Notify external `on` listeners with a computed event.
pub fn emit_with(f: impl Fn(&Value, &Event) -> EmittedEvent + Send + Sync + 'static) -> Action {
    Action::Emit(Dynamic::from_fn(f))
}

/// Runtime-conditional action composition. The collector runs with the
/// current context and can enqueue further actions, which are executed
/// immediately and in order; nested effects share the outer deferred queue.
pub fn enqueue_actions(
    f: impl Fn(&Value, &Event, &mut ActionCollector) + Send + Sync + 'static,
) -> Action {
    Action::EnqueueActions(Arc::new(f))
}

/// Spawn a child actor under a static id.
pub fn spawn_child(definition: Arc<MachineDefinition>, id: impl Into<String>) -> Action {
    Action::SpawnChild {
        definition,
        id: Dynamic::Static(id.into()),
    }
}

/// Spawn a child actor under a computed id.
pub fn spawn_child_with(
    definition: Arc<MachineDefinition>,
    f: impl Fn(&Value, &Event) -> String + Send + Sync + 'static,
) -> Action {
    Action::SpawnChild {
        definition,
        id: Dynamic::from_fn(f),
    }
}

/// Stop and remove the named child.
pub fn stop_child(id: impl Into<String>) -> Action {
    Action::StopChild(Dynamic::Static(id.into()))
}

/// Stop and remove a child whose id is computed at execution time.
pub fn stop_child_with(f: impl Fn(&Value, &Event) -> String + Send + Sync + 'static) -> Action {
    Action::StopChild(Dynamic::from_fn(f))
}

/// Send a static event to the named child.
pub fn send_to(target: impl Into<String>, event: Event) -> Action {
    Action::SendTo {
        target: Dynamic::Static(target.into()),
        event: Dynamic::Static(event),
    }
}

/// Send to a child where target and event are each a value or a function.
pub fn send_to_with(target: Dynamic<String>, event: Dynamic<Event>) -> Action {
    Action::SendTo { target, event }
}

/// Send a static event to the parent actor.
pub fn send_parent(event: Event) -> Action {
    Action::SendParent(Dynamic::Static(event))
}

/// Send a computed event to the parent actor.
pub fn send_parent_with(f: impl Fn(&Value, &Event) -> Event + Send + Sync + 'static) -> Action {
    Action::SendParent(Dynamic::from_fn(f))
}

/// Forward the currently processing event to the named child.
pub fn forward_to(target: impl Into<String>) -> Action {
    Action::ForwardTo(Dynamic::Static(target.into()))
}

/// Forward to a child whose id is computed at execution time.
pub fn forward_to_with(f: impl Fn(&Value, &Event) -> String + Send + Sync + 'static) -> Action {
    Action::ForwardTo(Dynamic::from_fn(f))
}

// =============================================================================
// Collector for enqueue_actions
// =============================================================================

/// Builder handed to `enqueue_actions` collector functions.
#[derive(Default)]
pub struct ActionCollector {
    actions: Vec<Action>,
}

impl ActionCollector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Enqueue an arbitrary action.
    pub fn push(&mut self, action: Action) {
        self.actions.push(action);
    }

    /// Convenience for enqueuing an assign.
    pub fn assign(&mut self, f: impl Fn(&Value, &Event) -> Value + Send + Sync + 'static) {
        self.actions.push(assign(f));
    }

    /// Convenience for enqueuing a raise.
    pub fn raise(&mut self, event: Event) {
        self.actions.push(raise(event));
    }

    /// Convenience for enqueuing a deferred effect.
    pub fn effect<F, Fut>(&mut self, f: F)
    where
        F: Fn(&Value, &Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.actions.push(effect(f));
    }

    pub(crate) fn into_actions(self) -> Vec<Action> {
        self.actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dynamic_static_resolve() {
        let d: Dynamic<String> = "fixed".into();
        assert_eq!(d.resolve(&json!({}), &Event::tag_only("X")), "fixed");
    }

    #[test]
    fn test_dynamic_computed_resolve() {
        let d = Dynamic::from_fn(|ctx: &Value, event: &Event| {
            format!("{}-{}", ctx["id"].as_str().unwrap_or(""), event.tag())
        });
        assert_eq!(
            d.resolve(&json!({"id": "a"}), &Event::tag_only("GO")),
            "a-GO"
        );
    }

    #[test]
    fn test_collector_preserves_order() {
        let mut collector = ActionCollector::new();
        collector.assign(|_, _| json!({"a": 1}));
        collector.raise(Event::tag_only("NEXT"));
        collector.push(cancel("t1"));

        let actions = collector.into_actions();
        assert_eq!(actions.len(), 3);
        assert!(matches!(actions[0], Action::Assign(_)));
        assert!(matches!(actions[1], Action::Raise(_)));
        assert!(matches!(actions[2], Action::Cancel(_)));
    }
}
