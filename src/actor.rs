//! The live actor runtime.
//!
//! `interpret` turns an immutable [`MachineDefinition`] into an [`Actor`]:
//! a mailbox-driven interpreter that processes one event at a time,
//! produces a new immutable snapshot per committed transition, supervises
//! state-scoped background work (activities, invoked operations, delayed
//! transitions), and owns a hierarchy of child actors.
//!
//! Concurrency model: transition processing is single-threaded per actor;
//! the mailbox guarantees no two events are mid-transition concurrently.
//! Background work runs as tokio tasks whose results re-enter through the
//! mailbox, so context mutation is never racy. Nothing here ever panics or
//! errors out of `send`; failures reach callers through `on_error`.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::runtime::Handle;
use uuid::Uuid;

use crate::action::{Action, ActionCollector, Dynamic, EffectFn};
use crate::definition::{
    Activity, ActivityArgs, After, DelaySpec, Invoke, MachineDefinition, Transition,
    FAILURE_TAG_FIELD,
};
use crate::error::MachineError;
use crate::event::{EmittedEvent, Event};
use crate::guard::panic_message;
use crate::mailbox::Mailbox;
use crate::snapshot::{merge_context, ChildSnapshot, MachineSnapshot};
use crate::work::{PendingInvoke, WorkRegistry};

type ObserverFn = Arc<dyn Fn(&MachineSnapshot) + Send + Sync>;
type ErrorFn = Arc<dyn Fn(&MachineError) + Send + Sync>;
type EmitFn = Arc<dyn Fn(&EmittedEvent) + Send + Sync>;

/// An effect action collected during a transition, flushed after commit.
struct DeferredEffect {
    run: EffectFn,
    event: Event,
}

pub(crate) struct ActorInner {
    definition: Arc<MachineDefinition>,
    runtime: Handle,
    parent: Weak<ActorInner>,
    snapshot: RwLock<MachineSnapshot>,
    mailbox: Mutex<Mailbox>,
    work: WorkRegistry,
    deferred: Mutex<Vec<DeferredEffect>>,
    observers: Mutex<HashMap<u64, ObserverFn>>,
    error_handlers: Mutex<HashMap<u64, ErrorFn>>,
    emit_listeners: Mutex<HashMap<String, HashMap<u64, EmitFn>>>,
    children: RwLock<HashMap<String, Actor>>,
    next_subscription: AtomicU64,
    stopped: AtomicBool,
}

/// Interprets a definition on the ambient tokio runtime.
pub fn interpret(definition: Arc<MachineDefinition>) -> Result<Actor, MachineError> {
    let runtime = Handle::try_current().map_err(|_| MachineError::NoRuntime)?;
    Ok(interpret_on(definition, runtime))
}

/// Interprets a definition on an explicit runtime handle. Children inherit
/// the handle.
pub fn interpret_on(definition: Arc<MachineDefinition>, runtime: Handle) -> Actor {
    Actor::start(definition, runtime, Weak::new())
}

/// A live actor. Cheap to clone; all clones address the same runtime
/// instance.
#[derive(Clone)]
pub struct Actor {
    inner: Arc<ActorInner>,
}

impl Actor {
    fn start(definition: Arc<MachineDefinition>, runtime: Handle, parent: Weak<ActorInner>) -> Self {
        let snapshot = definition.initial_snapshot().clone();
        let initial = snapshot.value.clone();
        let actor = Actor {
            inner: Arc::new(ActorInner {
                definition,
                runtime,
                parent,
                snapshot: RwLock::new(snapshot),
                mailbox: Mutex::new(Mailbox::new()),
                work: WorkRegistry::new(),
                deferred: Mutex::new(Vec::new()),
                observers: Mutex::new(HashMap::new()),
                error_handlers: Mutex::new(HashMap::new()),
                emit_listeners: Mutex::new(HashMap::new()),
                children: RwLock::new(HashMap::new()),
                next_subscription: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
            }),
        };
        // First entry into the initial state: entry actions do not run
        // (the initial snapshot is precomputed), but work starts.
        actor.start_state_work(&initial, &Event::Init);
        actor
    }

    // =========================================================================
    // Public surface
    // =========================================================================

    /// Enqueues an event. Never blocks and never fails: unknown and
    /// guarded-out events are silently ignored, and events sent to a
    /// stopped actor are accepted but dropped by the processor.
    pub fn send(&self, event: Event) {
        let drive = { self.inner.mailbox.lock().push(event) };
        if !drive {
            return;
        }
        loop {
            let next = { self.inner.mailbox.lock().next() };
            match next {
                Some(event) => self.process(event),
                None => break,
            }
        }
    }

    /// The last committed (or synced) snapshot.
    pub fn snapshot(&self) -> MachineSnapshot {
        self.inner.snapshot.read().clone()
    }

    /// A handle for pushing events into this actor from background work.
    /// Holds only a weak reference; sends after the actor is gone are
    /// no-ops.
    pub fn sender(&self) -> EventSender {
        EventSender {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Registers a snapshot observer, invoked synchronously after every
    /// committed transition, in subscription order. A panicking observer
    /// is isolated from the others.
    pub fn subscribe(
        &self,
        observer: impl Fn(&MachineSnapshot) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_subscription_id();
        self.inner.observers.lock().insert(id, Arc::new(observer));
        Subscription {
            inner: Arc::downgrade(&self.inner),
            kind: SubscriptionKind::Snapshot,
            id,
        }
    }

    /// Registers a listener for `emit` actions with the given kind,
    /// independent of the snapshot stream.
    pub fn on(
        &self,
        kind: impl Into<String>,
        listener: impl Fn(&EmittedEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let kind = kind.into();
        let id = self.next_subscription_id();
        self.inner
            .emit_listeners
            .lock()
            .entry(kind.clone())
            .or_default()
            .insert(id, Arc::new(listener));
        Subscription {
            inner: Arc::downgrade(&self.inner),
            kind: SubscriptionKind::Emit(kind),
            id,
        }
    }

    /// Registers a handler for runtime failures (effects, activities,
    /// guard panics). Without one, those failures are logged and lost.
    pub fn on_error(
        &self,
        handler: impl Fn(&MachineError) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_subscription_id();
        self.inner
            .error_handlers
            .lock()
            .insert(id, Arc::new(handler));
        Subscription {
            inner: Arc::downgrade(&self.inner),
            kind: SubscriptionKind::Error,
            id,
        }
    }

    /// Resolves with the first committed snapshot satisfying the
    /// predicate, checking the current snapshot immediately. Dropping the
    /// future cancels the wait and cleans up its subscription.
    pub async fn wait_for(
        &self,
        predicate: impl Fn(&MachineSnapshot) -> bool + Send + Sync + 'static,
    ) -> MachineSnapshot {
        let predicate = Arc::new(predicate);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let pred = predicate.clone();
        // Subscribe before the immediate check so a transition between the
        // two cannot be missed.
        let subscription = self.subscribe(move |snapshot| {
            if pred(snapshot) {
                let _ = tx.send(snapshot.clone());
            }
        });

        let current = self.snapshot();
        if predicate(&current) {
            drop(subscription);
            return current;
        }

        match rx.recv().await {
            Some(snapshot) => {
                drop(subscription);
                snapshot
            }
            // The actor is gone; the predicate can never be satisfied.
            None => std::future::pending().await,
        }
    }

    /// Number of registered snapshot observers.
    pub fn observer_count(&self) -> usize {
        self.inner.observers.lock().len()
    }

    /// Ids of live children, sorted.
    pub fn children(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.children.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The named child, if spawned.
    pub fn child(&self, id: &str) -> Option<Actor> {
        self.inner.children.read().get(id).cloned()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Stops the actor: cancels all background work (persistent delays
    /// included), cascades to every descendant, and turns the processor
    /// into a no-op. Idempotent.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(machine = %self.inner.definition.id, "stopping actor");
        let children: Vec<Actor> = {
            self.inner
                .children
                .write()
                .drain()
                .map(|(_, child)| child)
                .collect()
        };
        for child in children {
            child.stop();
        }
        self.inner.work.abort_all();
        self.inner.deferred.lock().clear();
    }

    // =========================================================================
    // Framework-integration hooks
    // =========================================================================

    /// Replaces the snapshot from an external authority (e.g. after a
    /// server round-trip). Rides the mailbox as a `$sync` pseudo-event:
    /// no entry/exit actions and no guards run; activities and ordinary
    /// delays restart only if the state value actually changed; child
    /// snapshots are applied recursively down the subtree of matching
    /// named children.
    pub fn sync_snapshot(&self, snapshot: MachineSnapshot, children: Vec<ChildSnapshot>) {
        self.send(Event::Sync {
            snapshot: Box::new(snapshot),
            children,
        });
    }

    /// Cancels current-state activities and ordinary delays without
    /// touching the snapshot, recursing into children. Persistent delays
    /// keep running.
    pub fn pause_activities(&self) {
        self.inner.work.cancel_activities();
        self.inner.work.cancel_transient_delays();
        let children: Vec<Actor> = self.inner.children.read().values().cloned().collect();
        for child in children {
            child.pause_activities();
        }
    }

    /// Restarts current-state activities and reschedules `after` delays
    /// (triggered by a `$resume` pseudo-event), recursing into children.
    pub fn resume_activities(&self) {
        self.send(Event::Resume);
    }

    // =========================================================================
    // Event processing
    // =========================================================================

    fn process(&self, event: Event) {
        if self.is_stopped() {
            tracing::trace!(machine = %self.inner.definition.id, tag = event.tag(), "actor stopped; dropping event");
            return;
        }
        match event {
            Event::Init => {}
            Event::User { .. } => self.handle_user(event),
            Event::After { .. } => self.handle_after(event),
            Event::InvokeSuccess { .. }
            | Event::InvokeFailure { .. }
            | Event::InvokeDefect { .. }
            | Event::InvokeInterrupt { .. } => self.handle_invoke_outcome(event),
            Event::Sync { .. } => self.apply_sync(event),
            Event::Resume => self.apply_resume(),
        }
    }

    fn handle_user(&self, event: Event) {
        let (current, transition) = {
            let snapshot = self.inner.snapshot.read();
            let Some(node) = self.inner.definition.states.get(&snapshot.value) else {
                return;
            };
            match node.on.get(event.tag()) {
                Some(transition) => (snapshot.value.clone(), transition.clone()),
                None => {
                    tracing::trace!(
                        machine = %self.inner.definition.id,
                        state = %snapshot.value,
                        tag = event.tag(),
                        "unhandled event"
                    );
                    return;
                }
            }
        };
        self.take_guarded_transition(&current, &transition, &event);
    }

    fn handle_after(&self, event: Event) {
        let Event::After { key, target } = &event else {
            return;
        };
        self.inner.work.remove_delay(key);
        let current = self.inner.snapshot.read().value.clone();
        let configured = self
            .inner
            .definition
            .states
            .get(&current)
            .and_then(|node| node.after.iter().find(|after| &after.id == key))
            .map(|after| after.transition.clone());

        if let Some(transition) = configured {
            self.take_guarded_transition(&current, &transition, &event);
        } else if let Some(target) = target {
            // A persistent delay that outlived its owning state: take the
            // originally configured target, with no actions.
            let transition = Transition::to(target.clone());
            self.take_guarded_transition(&current, &transition, &event);
        } else {
            tracing::trace!(
                machine = %self.inner.definition.id,
                key = %key,
                "delay no longer configured; dropping"
            );
        }
    }

    fn handle_invoke_outcome(&self, event: Event) {
        let Some(id) = event.invoke_id().map(str::to_string) else {
            return;
        };
        // Exactly one outcome per attempt: claiming the pending entry here
        // makes any later outcome for the same id spurious.
        let Some(pending) = self.inner.work.take_invoke(&id) else {
            tracing::warn!(
                machine = %self.inner.definition.id,
                id = %id,
                tag = event.tag(),
                "dropping spurious invoke outcome"
            );
            return;
        };
        let Some(invoke) = self
            .inner
            .definition
            .states
            .get(&pending.state)
            .and_then(|node| node.invoke.as_ref())
        else {
            return;
        };

        let handler = match &event {
            Event::InvokeSuccess { .. } => invoke.on_success.as_ref(),
            Event::InvokeFailure { error, .. } => error
                .get(FAILURE_TAG_FIELD)
                .and_then(Value::as_str)
                .and_then(|tag| invoke.catch_tags.get(tag))
                .or(invoke.on_failure.as_ref()),
            Event::InvokeDefect { .. } => invoke.on_defect.as_ref(),
            Event::InvokeInterrupt { .. } => invoke.on_interrupt.as_ref(),
            _ => None,
        };

        let assign = match (&event, invoke.assign_result.as_ref()) {
            (Event::InvokeSuccess { value, .. }, Some(f)) => Some((f.clone(), value.clone())),
            _ => None,
        };

        let mut transition = match handler {
            Some(transition) => transition.clone(),
            None if assign.is_some() => Transition::stay(),
            None => {
                tracing::trace!(
                    machine = %self.inner.definition.id,
                    tag = event.tag(),
                    "no handler for invoke outcome; dropping"
                );
                return;
            }
        };
        if let Some((f, value)) = assign {
            transition
                .actions
                .insert(0, Action::Assign(Dynamic::from_fn(move |ctx, _| f(ctx, &value))));
        }

        let current = self.inner.snapshot.read().value.clone();
        self.take_guarded_transition(&current, &transition, &event);
    }

    fn apply_sync(&self, event: Event) {
        let Event::Sync { snapshot, children } = &event else {
            return;
        };
        let incoming = (**snapshot).clone();
        if !self.inner.definition.has_state(&incoming.value) {
            tracing::warn!(
                machine = %self.inner.definition.id,
                value = %incoming.value,
                "sync snapshot targets unknown state; ignoring"
            );
            return;
        }
        let changed = self.inner.snapshot.read().value != incoming.value;
        if changed {
            // Hard replace: the state is overwritten, not transitioned
            // through, so no exit actions run. In-flight invokes are left
            // alone and resolve through their owning state's handlers.
            self.inner.work.cancel_activities();
            self.inner.work.cancel_transient_delays();
        }
        *self.inner.snapshot.write() = incoming.clone();
        for child_sync in children.clone() {
            if let Some(child) = self.child(&child_sync.id) {
                child.sync_snapshot(child_sync.snapshot, child_sync.children);
            }
        }
        if changed {
            self.start_ambient_work(&incoming.value, &event);
        }
        self.notify_observers(&incoming);
    }

    fn apply_resume(&self) {
        let value = self.inner.snapshot.read().value.clone();
        self.start_ambient_work(&value, &Event::Resume);
        let children: Vec<Actor> = self.inner.children.read().values().cloned().collect();
        for child in children {
            child.resume_activities();
        }
    }

    // =========================================================================
    // Transition engine
    // =========================================================================

    fn take_guarded_transition(&self, current: &str, transition: &Transition, event: &Event) {
        if let Some(guard) = &transition.guard {
            let ctx = self.inner.snapshot.read().context.clone();
            match guard.evaluate(&ctx, event) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::trace!(
                        machine = %self.inner.definition.id,
                        state = %current,
                        tag = event.tag(),
                        "guard blocked transition"
                    );
                    return;
                }
                Err(message) => {
                    self.report_error(&MachineError::GuardPanicked {
                        state: current.to_string(),
                        event: event.tag().to_string(),
                        message,
                    });
                    return;
                }
            }
        }
        self.take_transition(transition, event);
    }

    /// The transition algorithm: exit actions, state-work cancellation,
    /// transition actions, entry actions, snapshot commit, work start,
    /// deferred-effect flush, observer notification. Self-transitions
    /// (no target change) skip exit/entry and leave work running.
    fn take_transition(&self, transition: &Transition, event: &Event) {
        let (current, mut ctx) = {
            let snapshot = self.inner.snapshot.read();
            (snapshot.value.clone(), snapshot.context.clone())
        };
        let target = transition.target.clone().unwrap_or_else(|| current.clone());
        let is_transition = target != current;

        if is_transition {
            if let Some(node) = self.inner.definition.states.get(&current) {
                ctx = self.run_actions(&node.exit, ctx, event);
            }
            self.stop_state_work();
        }

        ctx = self.run_actions(&transition.actions, ctx, event);

        if is_transition {
            if let Some(node) = self.inner.definition.states.get(&target) {
                ctx = self.run_actions(&node.entry, ctx, event);
            }
        }

        let snapshot = MachineSnapshot {
            value: target.clone(),
            context: ctx,
            event: Some(event.clone()),
        };
        *self.inner.snapshot.write() = snapshot.clone();
        tracing::trace!(
            machine = %self.inner.definition.id,
            from = %current,
            to = %target,
            tag = event.tag(),
            "committed transition"
        );

        if is_transition {
            self.start_state_work(&target, event);
        }
        self.flush_deferred();
        self.notify_observers(&snapshot);
    }

    /// Runs an action list in order against a context, returning the new
    /// context. Only `assign` mutates the context; `effect` is deferred.
    fn run_actions(&self, actions: &[Action], mut ctx: Value, event: &Event) -> Value {
        for action in actions {
            match action {
                Action::Assign(partial) => {
                    let partial = partial.resolve(&ctx, event);
                    ctx = merge_context(&ctx, &partial);
                }
                Action::Effect(run) => {
                    self.inner.deferred.lock().push(DeferredEffect {
                        run: run.clone(),
                        event: event.clone(),
                    });
                }
                Action::Raise(raised) => {
                    let raised = raised.resolve(&ctx, event);
                    // Appended to the mailbox; processed only after the
                    // current event fully finishes.
                    self.send(raised);
                }
                Action::Cancel(id) => {
                    let id = id.resolve(&ctx, event);
                    if !self.inner.work.cancel_delay(&id) {
                        tracing::trace!(
                            machine = %self.inner.definition.id,
                            id = %id,
                            "cancel: no pending delay"
                        );
                    }
                }
                Action::Emit(emitted) => {
                    let emitted = emitted.resolve(&ctx, event);
                    self.deliver_emitted(&emitted);
                }
                Action::EnqueueActions(collect) => {
                    let mut collector = ActionCollector::new();
                    collect(&ctx, event, &mut collector);
                    ctx = self.run_actions(&collector.into_actions(), ctx, event);
                }
                Action::SpawnChild { definition, id } => {
                    let id = id.resolve(&ctx, event);
                    self.spawn_child_actor(definition.clone(), id);
                }
                Action::StopChild(id) => {
                    let id = id.resolve(&ctx, event);
                    self.stop_child_actor(&id);
                }
                Action::SendTo { target, event: to_send } => {
                    let target = target.resolve(&ctx, event);
                    let to_send = to_send.resolve(&ctx, event);
                    if let Some(child) = self.child(&target) {
                        child.send(to_send);
                    }
                }
                Action::SendParent(to_send) => {
                    let to_send = to_send.resolve(&ctx, event);
                    if let Some(parent) = self.inner.parent.upgrade() {
                        Actor { inner: parent }.send(to_send);
                    }
                }
                Action::ForwardTo(target) => {
                    let target = target.resolve(&ctx, event);
                    if let Some(child) = self.child(&target) {
                        child.send(event.clone());
                    }
                }
            }
        }
        ctx
    }

    /// Kicks off the effects deferred during the transition, against the
    /// committed context. Runs before observer notification; completions
    /// report asynchronously through `on_error`.
    fn flush_deferred(&self) {
        let effects: Vec<DeferredEffect> = {
            let mut deferred = self.inner.deferred.lock();
            deferred.drain(..).collect()
        };
        if effects.is_empty() {
            return;
        }
        let ctx = self.inner.snapshot.read().context.clone();
        for DeferredEffect { run, event } in effects {
            let fut = run(&ctx, &event);
            let task = self.inner.runtime.spawn(fut);
            let weak = Arc::downgrade(&self.inner);
            self.inner.runtime.spawn(async move {
                let source = match task.await {
                    Ok(Ok(())) => return,
                    Ok(Err(source)) => source,
                    Err(join) if join.is_cancelled() => return,
                    Err(join) => anyhow::anyhow!("effect panicked: {}", panic_message(join.into_panic())),
                };
                if let Some(inner) = weak.upgrade() {
                    Actor { inner }.report_error(&MachineError::EffectFailed { source });
                }
            });
        }
    }

    // =========================================================================
    // Background work supervision
    // =========================================================================

    /// Cancels work scoped to the state being left: activities, the
    /// in-flight invoke (kept pending so its interrupt outcome can still
    /// route), and ordinary delays. Persistent delays survive.
    fn stop_state_work(&self) {
        self.inner.work.cancel_activities();
        self.inner.work.abort_invokes();
        self.inner.work.cancel_transient_delays();
    }

    /// Starts activities and delay timers for a state. Shared by real
    /// entry, `$sync` state changes, and `$resume`.
    fn start_ambient_work(&self, state: &str, event: &Event) {
        let definition = self.inner.definition.clone();
        let Some(node) = definition.states.get(state) else {
            return;
        };
        let ctx = self.inner.snapshot.read().context.clone();
        for activity in &node.activities {
            self.start_activity(activity, &ctx, event);
        }
        for after in &node.after {
            self.schedule_after(after, &ctx, event);
        }
    }

    /// Full state entry: ambient work plus the invoked operation. The
    /// invoke is single-shot and deliberately not restarted by sync or
    /// resume.
    fn start_state_work(&self, state: &str, event: &Event) {
        self.start_ambient_work(state, event);
        let definition = self.inner.definition.clone();
        if let Some(invoke) = definition
            .states
            .get(state)
            .and_then(|node| node.invoke.as_ref())
        {
            let ctx = self.inner.snapshot.read().context.clone();
            self.start_invoke(state, invoke, &ctx, event);
        }
    }

    fn start_activity(&self, activity: &Activity, ctx: &Value, event: &Event) {
        tracing::debug!(
            machine = %self.inner.definition.id,
            activity = %activity.id,
            "starting activity"
        );
        let args = ActivityArgs {
            context: ctx.clone(),
            event: event.clone(),
            sender: self.sender(),
        };
        let task = self.inner.runtime.spawn((activity.run)(args));
        self.inner
            .work
            .insert_activity(activity.id.clone(), task.abort_handle());

        let weak = Arc::downgrade(&self.inner);
        let id = activity.id.clone();
        self.inner.runtime.spawn(async move {
            let source = match task.await {
                Ok(Ok(())) => return,
                Ok(Err(source)) => source,
                Err(join) if join.is_cancelled() => return,
                Err(join) => {
                    anyhow::anyhow!("activity panicked: {}", panic_message(join.into_panic()))
                }
            };
            if let Some(inner) = weak.upgrade() {
                Actor { inner }.report_error(&MachineError::ActivityFailed { id, source });
            }
        });
    }

    fn start_invoke(&self, state: &str, invoke: &Invoke, ctx: &Value, event: &Event) {
        let attempt = Uuid::new_v4().to_string();
        let task = self.inner.runtime.spawn((invoke.src)(ctx, event));
        self.inner.work.insert_invoke(
            attempt.clone(),
            PendingInvoke {
                state: state.to_string(),
                abort: task.abort_handle(),
            },
        );
        let sender = self.sender();
        self.inner.runtime.spawn(async move {
            let outcome = match task.await {
                Ok(Ok(value)) => Event::InvokeSuccess { id: attempt, value },
                Ok(Err(error)) => Event::InvokeFailure { id: attempt, error },
                Err(join) if join.is_cancelled() => Event::InvokeInterrupt { id: attempt },
                Err(join) => Event::InvokeDefect {
                    id: attempt,
                    message: panic_message(join.into_panic()),
                },
            };
            sender.send(outcome);
        });
    }

    fn schedule_after(&self, after: &After, ctx: &Value, event: &Event) {
        // Re-entering the owning state must not restart a pending
        // persistent clock.
        if after.persistent && self.inner.work.has_delay(&after.id) {
            return;
        }
        let fire = Event::After {
            key: after.id.clone(),
            target: if after.persistent {
                after.transition.target.clone()
            } else {
                None
            },
        };
        // The sleep is constructed inside the task so scheduling works from
        // threads outside the runtime.
        let task = match &after.delay {
            DelaySpec::Duration(duration) => {
                let duration = *duration;
                self.inner
                    .runtime
                    .spawn(async move { tokio::time::sleep(duration).await })
            }
            DelaySpec::Until(condition) => self.inner.runtime.spawn(condition(ctx, event)),
        };
        // Register before the watcher exists: the fire event can only be
        // sent once its bookkeeping entry is in place, so even a zero
        // delay cannot outrun its own registration.
        if !self
            .inner
            .work
            .try_insert_delay(&after.id, task.abort_handle(), after.persistent)
        {
            return;
        }
        let sender = self.sender();
        self.inner.runtime.spawn(async move {
            if task.await.is_ok() {
                sender.send(fire);
            }
        });
    }

    // =========================================================================
    // Hierarchy
    // =========================================================================

    /// Spawns a child under the given id, inheriting the runtime handle.
    /// Idempotent: an already-used id is a no-op, supporting re-entrant
    /// spawn patterns in entry actions.
    fn spawn_child_actor(&self, definition: Arc<MachineDefinition>, id: String) {
        let mut children = self.inner.children.write();
        if children.contains_key(&id) {
            return;
        }
        tracing::debug!(
            machine = %self.inner.definition.id,
            child = %id,
            "spawning child actor"
        );
        let child = Actor::start(
            definition,
            self.inner.runtime.clone(),
            Arc::downgrade(&self.inner),
        );
        children.insert(id, child);
    }

    fn stop_child_actor(&self, id: &str) {
        let child = { self.inner.children.write().remove(id) };
        if let Some(child) = child {
            tracing::debug!(
                machine = %self.inner.definition.id,
                child = %id,
                "stopping child actor"
            );
            child.stop();
        }
    }

    // =========================================================================
    // Notification
    // =========================================================================

    fn notify_observers(&self, snapshot: &MachineSnapshot) {
        let mut observers: Vec<(u64, ObserverFn)> = {
            self.inner
                .observers
                .lock()
                .iter()
                .map(|(id, f)| (*id, f.clone()))
                .collect()
        };
        observers.sort_by_key(|(id, _)| *id);
        for (_, observer) in observers {
            if catch_unwind(AssertUnwindSafe(|| observer(snapshot))).is_err() {
                tracing::warn!(machine = %self.inner.definition.id, "snapshot observer panicked");
            }
        }
    }

    fn deliver_emitted(&self, emitted: &EmittedEvent) {
        let mut listeners: Vec<(u64, EmitFn)> = {
            self.inner
                .emit_listeners
                .lock()
                .get(&emitted.kind)
                .map(|set| set.iter().map(|(id, f)| (*id, f.clone())).collect())
                .unwrap_or_default()
        };
        listeners.sort_by_key(|(id, _)| *id);
        for (_, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(emitted))).is_err() {
                tracing::warn!(
                    machine = %self.inner.definition.id,
                    kind = %emitted.kind,
                    "emit listener panicked"
                );
            }
        }
    }

    fn report_error(&self, error: &MachineError) {
        tracing::error!(machine = %self.inner.definition.id, %error, "runtime failure");
        let mut handlers: Vec<(u64, ErrorFn)> = {
            self.inner
                .error_handlers
                .lock()
                .iter()
                .map(|(id, f)| (*id, f.clone()))
                .collect()
        };
        handlers.sort_by_key(|(id, _)| *id);
        for (_, handler) in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(error))).is_err() {
                tracing::warn!(machine = %self.inner.definition.id, "error handler panicked");
            }
        }
    }

    fn next_subscription_id(&self) -> u64 {
        self.inner.next_subscription.fetch_add(1, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actor")
            .field("machine", &self.inner.definition.id)
            .field("value", &self.inner.snapshot.read().value)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Weak event-sending handle given to activities and background tasks.
#[derive(Clone)]
pub struct EventSender {
    inner: Weak<ActorInner>,
}

impl EventSender {
    /// Enqueues an event; a no-op once the actor is gone.
    pub fn send(&self, event: Event) {
        if let Some(inner) = self.inner.upgrade() {
            Actor { inner }.send(event);
        }
    }
}

enum SubscriptionKind {
    Snapshot,
    Error,
    Emit(String),
}

/// RAII handle for an observer/listener/error-handler registration.
/// Unsubscribes on drop.
pub struct Subscription {
    inner: Weak<ActorInner>,
    kind: SubscriptionKind,
    id: u64,
}

impl Subscription {
    /// Explicit unsubscribe; equivalent to dropping.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        match &self.kind {
            SubscriptionKind::Snapshot => {
                inner.observers.lock().remove(&self.id);
            }
            SubscriptionKind::Error => {
                inner.error_handlers.lock().remove(&self.id);
            }
            SubscriptionKind::Emit(kind) => {
                let mut listeners = inner.emit_listeners.lock();
                if let Some(set) = listeners.get_mut(kind) {
                    set.remove(&self.id);
                    if set.is_empty() {
                        listeners.remove(kind);
                    }
                }
            }
        }
    }
}
