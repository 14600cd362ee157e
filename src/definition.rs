//! Machine definitions.
//!
//! A definition is the immutable configuration an actor interprets: states,
//! transitions, guards, entry/exit actions, activities, a single invoked
//! operation per state, and delayed transitions. Built once through the
//! fluent builder, validated, and shareable across many independently
//! interpreted actors.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::action::Action;
use crate::actor::EventSender;
use crate::error::MachineError;
use crate::event::Event;
use crate::guard::Guard;
use crate::snapshot::MachineSnapshot;

// =============================================================================
// Transitions
// =============================================================================

/// A transition: optional target (absent = self-transition), optional
/// guard, ordered actions, and an optional stable id used to name the
/// timer when the transition is scheduled under `after`.
#[derive(Debug, Clone, Default)]
pub struct Transition {
    pub(crate) target: Option<String>,
    pub(crate) guard: Option<Guard>,
    pub(crate) actions: Vec<Action>,
    pub(crate) id: Option<String>,
}

impl Transition {
    /// A transition into the named target state.
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            ..Self::default()
        }
    }

    /// A self-transition: stay in the current state, run actions, skip
    /// entry/exit, keep activities/invoke/after running.
    pub fn stay() -> Self {
        Self::default()
    }

    /// Gate the transition on a predicate over `{context, event}`.
    pub fn guard(mut self, f: impl Fn(&Value, &Event) -> bool + Send + Sync + 'static) -> Self {
        self.guard = Some(Guard::new(f));
        self
    }

    /// Append a single action.
    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Append actions, preserving order.
    pub fn actions(mut self, actions: impl IntoIterator<Item = Action>) -> Self {
        self.actions.extend(actions);
        self
    }

    /// Stable id, used as the delay key for `after` scheduling and the
    /// `cancel` action.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// The target state, if this is not a self-transition.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }
}

// =============================================================================
// Activities
// =============================================================================

/// Arguments handed to an activity when its owning state is entered.
pub struct ActivityArgs {
    /// Context at start time.
    pub context: Value,
    /// The event that triggered entry.
    pub event: Event,
    /// Handle for pushing events back into the actor.
    pub sender: EventSender,
}

pub type ActivityFn =
    Arc<dyn Fn(ActivityArgs) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A long-running, state-scoped background operation. Started fresh on
/// every (re-)entry into its owning state; genuinely interrupted (dropped)
/// when the state is exited or the actor stops.
#[derive(Clone)]
pub struct Activity {
    pub(crate) id: String,
    pub(crate) run: ActivityFn,
}

impl Activity {
    pub fn new<F, Fut>(id: impl Into<String>, run: F) -> Self
    where
        F: Fn(ActivityArgs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            id: id.into(),
            run: Arc::new(move |args| run(args).boxed()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Debug for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activity").field("id", &self.id).finish()
    }
}

// =============================================================================
// Invoke
// =============================================================================

/// Single-shot asynchronous operation source: `Ok` is a success value,
/// `Err` is a typed failure value. A panic inside the future is a defect;
/// cancellation (state exit) is an interrupt.
pub type InvokeFn =
    Arc<dyn Fn(&Value, &Event) -> BoxFuture<'static, Result<Value, Value>> + Send + Sync>;

type AssignResultFn = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;

/// Field on a typed failure value used to route through `catch_tags`.
pub(crate) const FAILURE_TAG_FIELD: &str = "_tag";

/// The single invoked operation of a state, plus its outcome handlers.
#[derive(Clone)]
pub struct Invoke {
    pub(crate) src: InvokeFn,
    pub(crate) on_success: Option<Transition>,
    pub(crate) on_failure: Option<Transition>,
    pub(crate) on_defect: Option<Transition>,
    pub(crate) on_interrupt: Option<Transition>,
    pub(crate) catch_tags: HashMap<String, Transition>,
    pub(crate) assign_result: Option<AssignResultFn>,
}

impl Invoke {
    pub fn new<F, Fut>(src: F) -> Self
    where
        F: Fn(&Value, &Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, Value>> + Send + 'static,
    {
        Self {
            src: Arc::new(move |ctx, event| src(ctx, event).boxed()),
            on_success: None,
            on_failure: None,
            on_defect: None,
            on_interrupt: None,
            catch_tags: HashMap::new(),
            assign_result: None,
        }
    }

    /// Handler for a produced value.
    pub fn on_success(mut self, transition: Transition) -> Self {
        self.on_success = Some(transition);
        self
    }

    /// Alias for [`Invoke::on_success`].
    pub fn on_done(self, transition: Transition) -> Self {
        self.on_success(transition)
    }

    /// Generic handler for typed failures, consulted after `catch_tags`.
    pub fn on_failure(mut self, transition: Transition) -> Self {
        self.on_failure = Some(transition);
        self
    }

    /// Alias for [`Invoke::on_failure`].
    pub fn on_error(self, transition: Transition) -> Self {
        self.on_failure(transition)
    }

    /// Handler for unexpected errors (panics inside the operation).
    pub fn on_defect(mut self, transition: Transition) -> Self {
        self.on_defect = Some(transition);
        self
    }

    /// Handler for cancellation mid-flight.
    pub fn on_interrupt(mut self, transition: Transition) -> Self {
        self.on_interrupt = Some(transition);
        self
    }

    /// Fine-grained failure routing keyed by the `_tag` field of the typed
    /// failure value. Takes precedence over `on_failure`.
    pub fn catch_tag(mut self, tag: impl Into<String>, transition: Transition) -> Self {
        self.catch_tags.insert(tag.into(), transition);
        self
    }

    /// On success, merge the returned partial (computed from the context
    /// and the produced value) into the context, with or without a
    /// transition.
    pub fn assign_result(
        mut self,
        f: impl Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.assign_result = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for Invoke {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invoke")
            .field("on_success", &self.on_success.is_some())
            .field("on_failure", &self.on_failure.is_some())
            .field("on_defect", &self.on_defect.is_some())
            .field("on_interrupt", &self.on_interrupt.is_some())
            .field("catch_tags", &self.catch_tags.keys())
            .finish()
    }
}

// =============================================================================
// Delayed transitions
// =============================================================================

type DelayFn = Arc<dyn Fn(&Value, &Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// How long a delayed transition waits before firing.
#[derive(Clone)]
pub enum DelaySpec {
    /// Fixed duration.
    Duration(Duration),
    /// Fires when the supplied operation resolves ("wait for a
    /// condition").
    Until(DelayFn),
}

impl fmt::Debug for DelaySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DelaySpec::Duration(d) => write!(f, "Duration({d:?})"),
            DelaySpec::Until(_) => f.write_str("Until(<fn>)"),
        }
    }
}

/// A delayed ("after") transition scheduled on state entry.
#[derive(Debug, Clone)]
pub struct After {
    /// Delay key: the transition's stable id, or synthesized at build
    /// time as `<state>.after.<index>`.
    pub(crate) id: String,
    pub(crate) delay: DelaySpec,
    pub(crate) transition: Transition,
    /// Persistent delays survive state exit; cancelled only by an explicit
    /// `cancel` action or actor stop.
    pub(crate) persistent: bool,
}

// =============================================================================
// States
// =============================================================================

/// Per-state configuration.
#[derive(Debug, Default)]
pub struct StateNode {
    pub(crate) entry: Vec<Action>,
    pub(crate) exit: Vec<Action>,
    pub(crate) on: HashMap<String, Transition>,
    pub(crate) activities: Vec<Activity>,
    pub(crate) invoke: Option<Invoke>,
    pub(crate) after: Vec<After>,
}

impl StateNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Actions run when the state is entered through a real transition.
    pub fn entry(mut self, actions: impl IntoIterator<Item = Action>) -> Self {
        self.entry.extend(actions);
        self
    }

    /// Actions run when the state is exited through a real transition.
    pub fn exit(mut self, actions: impl IntoIterator<Item = Action>) -> Self {
        self.exit.extend(actions);
        self
    }

    /// Transition taken when an event with the given tag arrives.
    pub fn on(mut self, tag: impl Into<String>, transition: Transition) -> Self {
        self.on.insert(tag.into(), transition);
        self
    }

    /// A long-running activity scoped to this state.
    pub fn activity(mut self, activity: Activity) -> Self {
        self.activities.push(activity);
        self
    }

    /// The state's single invoked operation.
    pub fn invoke(mut self, invoke: Invoke) -> Self {
        self.invoke = Some(invoke);
        self
    }

    /// Ordinary delayed transition: cancelled automatically on state exit.
    pub fn after(mut self, delay_ms: u64, transition: Transition) -> Self {
        self.after.push(After {
            id: String::new(),
            delay: DelaySpec::Duration(Duration::from_millis(delay_ms)),
            transition,
            persistent: false,
        });
        self
    }

    /// Persistent delayed transition: survives state exit, cancelled only
    /// by an explicit `cancel` action or actor stop.
    pub fn after_persistent(mut self, delay_ms: u64, transition: Transition) -> Self {
        self.after.push(After {
            id: String::new(),
            delay: DelaySpec::Duration(Duration::from_millis(delay_ms)),
            transition,
            persistent: true,
        });
        self
    }

    /// Delayed transition gated on an asynchronous condition instead of a
    /// fixed duration.
    pub fn after_until<F, Fut>(mut self, condition: F, transition: Transition) -> Self
    where
        F: Fn(&Value, &Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.after.push(After {
            id: String::new(),
            delay: DelaySpec::Until(Arc::new(move |ctx, event| condition(ctx, event).boxed())),
            transition,
            persistent: false,
        });
        self
    }
}

// =============================================================================
// Definition + builder
// =============================================================================

/// A validated, immutable machine definition.
pub struct MachineDefinition {
    /// Unique machine id (logging/diagnostics).
    pub id: String,

    /// Initial state for new actors.
    pub initial: String,

    /// Initial context for new actors.
    pub context: Value,

    pub(crate) states: HashMap<String, StateNode>,
    pub(crate) initial_snapshot: MachineSnapshot,
}

impl MachineDefinition {
    /// Starts a fluent builder for a machine with the given id.
    pub fn builder(id: impl Into<String>) -> MachineDefinitionBuilder {
        MachineDefinitionBuilder {
            id: id.into(),
            initial: None,
            context: Value::Object(Default::default()),
            states: Vec::new(),
        }
    }

    /// The precomputed snapshot a fresh actor starts from.
    pub fn initial_snapshot(&self) -> &MachineSnapshot {
        &self.initial_snapshot
    }

    /// Returns true if the given state name is valid for this machine.
    pub fn has_state(&self, state: &str) -> bool {
        self.states.contains_key(state)
    }

    /// All state names, unordered.
    pub fn state_names(&self) -> impl Iterator<Item = &str> {
        self.states.keys().map(String::as_str)
    }
}

impl fmt::Debug for MachineDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineDefinition")
            .field("id", &self.id)
            .field("initial", &self.initial)
            .field("states", &self.states.keys())
            .finish()
    }
}

/// Fluent builder for [`MachineDefinition`].
pub struct MachineDefinitionBuilder {
    id: String,
    initial: Option<String>,
    context: Value,
    states: Vec<(String, StateNode)>,
}

impl MachineDefinitionBuilder {
    /// Initial state for new actors (required).
    pub fn initial(mut self, state: impl Into<String>) -> Self {
        self.initial = Some(state.into());
        self
    }

    /// Initial context object. Defaults to `{}`.
    pub fn context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    /// Adds a named state.
    pub fn state(mut self, name: impl Into<String>, node: StateNode) -> Self {
        self.states.push((name.into(), node));
        self
    }

    /// Validates and builds the definition.
    pub fn build(self) -> Result<MachineDefinition, MachineError> {
        let initial = self.initial.ok_or_else(|| {
            MachineError::invalid_definition("no initial state configured")
        })?;

        let mut states: HashMap<String, StateNode> = HashMap::new();
        for (name, node) in self.states {
            if states.insert(name.clone(), node).is_some() {
                return Err(MachineError::invalid_definition(format!(
                    "duplicate state '{name}'"
                )));
            }
        }

        if !states.contains_key(&initial) {
            return Err(MachineError::invalid_definition(format!(
                "initial state '{initial}' is not a configured state"
            )));
        }

        // Synthesize delay ids before validation so duplicates are caught.
        for (name, node) in states.iter_mut() {
            let mut seen = std::collections::HashSet::new();
            for (index, after) in node.after.iter_mut().enumerate() {
                after.id = after
                    .transition
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("{name}.after.{index}"));
                if !seen.insert(after.id.clone()) {
                    return Err(MachineError::invalid_definition(format!(
                        "duplicate delay id '{}' in state '{name}'",
                        after.id
                    )));
                }
            }
        }

        for (name, node) in &states {
            let check = |target: Option<&String>, what: &str| -> Result<(), MachineError> {
                if let Some(target) = target {
                    if !states.contains_key(target) {
                        return Err(MachineError::invalid_definition(format!(
                            "{what} in state '{name}' targets unknown state '{target}'"
                        )));
                    }
                }
                Ok(())
            };

            for (tag, transition) in &node.on {
                check(transition.target.as_ref(), &format!("transition on '{tag}'"))?;
            }
            for after in &node.after {
                check(after.transition.target.as_ref(), "delayed transition")?;
            }
            if let Some(invoke) = &node.invoke {
                check(
                    invoke.on_success.as_ref().and_then(|t| t.target.as_ref()),
                    "invoke success handler",
                )?;
                check(
                    invoke.on_failure.as_ref().and_then(|t| t.target.as_ref()),
                    "invoke failure handler",
                )?;
                check(
                    invoke.on_defect.as_ref().and_then(|t| t.target.as_ref()),
                    "invoke defect handler",
                )?;
                check(
                    invoke.on_interrupt.as_ref().and_then(|t| t.target.as_ref()),
                    "invoke interrupt handler",
                )?;
                for (tag, transition) in &invoke.catch_tags {
                    check(
                        transition.target.as_ref(),
                        &format!("invoke catch tag '{tag}'"),
                    )?;
                }
            }
        }

        let initial_snapshot = MachineSnapshot::new(initial.clone(), self.context.clone());

        Ok(MachineDefinition {
            id: self.id,
            initial,
            context: self.context,
            states,
            initial_snapshot,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::assign_partial;
    use serde_json::json;

    fn two_states() -> MachineDefinitionBuilder {
        MachineDefinition::builder("order")
            .initial("created")
            .state("created", StateNode::new().on("PAY", Transition::to("paid")))
            .state("paid", StateNode::new())
    }

    #[test]
    fn test_build_valid_definition() {
        let def = two_states().context(json!({"amount": 0})).build().unwrap();
        assert_eq!(def.id, "order");
        assert_eq!(def.initial, "created");
        assert!(def.has_state("paid"));
        assert_eq!(def.initial_snapshot().value, "created");
        assert_eq!(def.initial_snapshot().context, json!({"amount": 0}));
    }

    #[test]
    fn test_missing_initial_rejected() {
        let result = MachineDefinition::builder("m")
            .state("a", StateNode::new())
            .build();
        assert!(matches!(
            result,
            Err(MachineError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn test_unknown_initial_rejected() {
        let result = MachineDefinition::builder("m")
            .initial("missing")
            .state("a", StateNode::new())
            .build();
        assert!(matches!(
            result,
            Err(MachineError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn test_unknown_transition_target_rejected() {
        let result = MachineDefinition::builder("m")
            .initial("a")
            .state("a", StateNode::new().on("GO", Transition::to("nowhere")))
            .build();
        assert!(matches!(
            result,
            Err(MachineError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn test_duplicate_state_rejected() {
        let result = MachineDefinition::builder("m")
            .initial("a")
            .state("a", StateNode::new())
            .state("a", StateNode::new())
            .build();
        assert!(matches!(
            result,
            Err(MachineError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn test_after_ids_synthesized_and_stable() {
        let def = MachineDefinition::builder("m")
            .initial("a")
            .state(
                "a",
                StateNode::new()
                    .after(10, Transition::to("b").id("named"))
                    .after(20, Transition::to("b")),
            )
            .state("b", StateNode::new())
            .build()
            .unwrap();

        let after = &def.states["a"].after;
        assert_eq!(after[0].id, "named");
        assert_eq!(after[1].id, "a.after.1");
    }

    #[test]
    fn test_duplicate_delay_id_rejected() {
        let result = MachineDefinition::builder("m")
            .initial("a")
            .state(
                "a",
                StateNode::new()
                    .after(10, Transition::to("b").id("t"))
                    .after(20, Transition::to("b").id("t")),
            )
            .state("b", StateNode::new())
            .build();
        assert!(matches!(
            result,
            Err(MachineError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn test_invoke_handler_targets_validated() {
        let result = MachineDefinition::builder("m")
            .initial("a")
            .state(
                "a",
                StateNode::new().invoke(
                    Invoke::new(|_, _| async { Ok(json!(1)) })
                        .on_success(Transition::to("gone")),
                ),
            )
            .build();
        assert!(matches!(
            result,
            Err(MachineError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn test_self_transition_has_no_target() {
        let transition = Transition::stay().action(assign_partial(json!({"n": 1})));
        assert!(transition.target().is_none());
    }
}
