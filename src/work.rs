//! State-scoped background work bookkeeping.
//!
//! Tracks cancellation handles for the three kinds of background work an
//! actor owns: activities, invoked operations, and delay timers. The
//! registry never spawns anything itself; the actor spawns tasks and
//! registers their abort handles here. Cancellation is genuine
//! interruption: aborting a tokio task drops its future, running any
//! registered cleanup.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::task::AbortHandle;

/// A pending invoked operation. Kept after the task is aborted so the
/// interrupt outcome can still resolve handlers from the owning state;
/// removed when any outcome for the attempt is processed.
pub(crate) struct PendingInvoke {
    /// State that started the invoke; outcome handlers resolve against it.
    pub state: String,
    pub abort: AbortHandle,
}

struct DelayEntry {
    abort: AbortHandle,
    persistent: bool,
}

#[derive(Default)]
pub(crate) struct WorkRegistry {
    activities: Mutex<HashMap<String, AbortHandle>>,
    invokes: Mutex<HashMap<String, PendingInvoke>>,
    delays: Mutex<HashMap<String, DelayEntry>>,
}

impl WorkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Activities
    // -------------------------------------------------------------------------

    pub fn insert_activity(&self, id: impl Into<String>, abort: AbortHandle) {
        if let Some(old) = self.activities.lock().insert(id.into(), abort) {
            // A lingering instance under the same id must not outlive the
            // replacement.
            old.abort();
        }
    }

    /// Cancels every running activity. Activities are only ever scoped to
    /// the current state, so state exit, pause, and stop all cancel the
    /// whole set.
    pub fn cancel_activities(&self) {
        for (_, handle) in self.activities.lock().drain() {
            handle.abort();
        }
    }

    // -------------------------------------------------------------------------
    // Invokes
    // -------------------------------------------------------------------------

    pub fn insert_invoke(&self, id: impl Into<String>, pending: PendingInvoke) {
        self.invokes.lock().insert(id.into(), pending);
    }

    /// Claims the pending entry for an outcome event. `None` means the
    /// outcome is spurious (already claimed) and must be dropped.
    pub fn take_invoke(&self, id: &str) -> Option<PendingInvoke> {
        self.invokes.lock().remove(id)
    }

    /// Aborts in-flight invoke tasks without forgetting them: the abort
    /// surfaces as an interrupt outcome which still needs its pending
    /// entry for handler resolution.
    pub fn abort_invokes(&self) {
        for pending in self.invokes.lock().values() {
            pending.abort.abort();
        }
    }

    fn clear_invokes(&self) {
        for (_, pending) in self.invokes.lock().drain() {
            pending.abort.abort();
        }
    }

    // -------------------------------------------------------------------------
    // Delays
    // -------------------------------------------------------------------------

    /// Registers a delay timer. Persistent delays already pending under the
    /// same id are left untouched (re-entry must not restart the clock);
    /// returns false when registration was skipped for that reason.
    pub fn try_insert_delay(&self, id: &str, abort: AbortHandle, persistent: bool) -> bool {
        let mut delays = self.delays.lock();
        if persistent && delays.contains_key(id) {
            abort.abort();
            return false;
        }
        if let Some(old) = delays.insert(id.to_string(), DelayEntry { abort, persistent }) {
            old.abort.abort();
        }
        true
    }

    /// True when a persistent delay is already pending under this id.
    pub fn has_delay(&self, id: &str) -> bool {
        self.delays.lock().contains_key(id)
    }

    /// Cancels the delay registered under `id`. No-op if absent.
    pub fn cancel_delay(&self, id: &str) -> bool {
        match self.delays.lock().remove(id) {
            Some(entry) => {
                entry.abort.abort();
                true
            }
            None => false,
        }
    }

    /// Drops the bookkeeping for a delay that already fired.
    pub fn remove_delay(&self, id: &str) {
        self.delays.lock().remove(id);
    }

    /// Cancels ordinary delays, leaving persistent ones running. Used on
    /// state exit and pause.
    pub fn cancel_transient_delays(&self) {
        let mut delays = self.delays.lock();
        delays.retain(|_, entry| {
            if entry.persistent {
                true
            } else {
                entry.abort.abort();
                false
            }
        });
    }

    fn cancel_all_delays(&self) {
        for (_, entry) in self.delays.lock().drain() {
            entry.abort.abort();
        }
    }

    // -------------------------------------------------------------------------
    // Stop
    // -------------------------------------------------------------------------

    /// Cancels everything, persistent delays included. Actor stop.
    pub fn abort_all(&self) {
        self.cancel_activities();
        self.clear_invokes();
        self.cancel_all_delays();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parked_handle() -> (tokio::task::JoinHandle<()>, AbortHandle) {
        let task = tokio::spawn(std::future::pending::<()>());
        let abort = task.abort_handle();
        (task, abort)
    }

    #[tokio::test]
    async fn test_activity_replacement_aborts_old() {
        let registry = WorkRegistry::new();
        let (old_task, old_abort) = parked_handle().await;
        let (_new_task, new_abort) = parked_handle().await;

        registry.insert_activity("a", old_abort);
        registry.insert_activity("a", new_abort);

        let err = old_task.await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_transient_keeps_persistent() {
        let registry = WorkRegistry::new();
        let (transient_task, transient_abort) = parked_handle().await;
        let (_persistent_task, persistent_abort) = parked_handle().await;

        registry.try_insert_delay("t", transient_abort, false);
        registry.try_insert_delay("p", persistent_abort, true);
        registry.cancel_transient_delays();

        assert!(transient_task.await.unwrap_err().is_cancelled());
        assert!(!registry.has_delay("t"));
        assert!(registry.has_delay("p"));
    }

    #[tokio::test]
    async fn test_persistent_delay_not_restarted() {
        let registry = WorkRegistry::new();
        let (_first_task, first_abort) = parked_handle().await;
        let (second_task, second_abort) = parked_handle().await;

        assert!(registry.try_insert_delay("p", first_abort, true));
        // Re-entry into the owning state must keep the original clock.
        assert!(!registry.try_insert_delay("p", second_abort, true));

        assert!(second_task.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_take_invoke_claims_once() {
        let registry = WorkRegistry::new();
        let (_task, abort) = parked_handle().await;
        registry.insert_invoke(
            "attempt-1",
            PendingInvoke {
                state: "loading".to_string(),
                abort,
            },
        );

        assert!(registry.take_invoke("attempt-1").is_some());
        assert!(registry.take_invoke("attempt-1").is_none());
    }

    #[tokio::test]
    async fn test_abort_invokes_keeps_pending_entry() {
        let registry = WorkRegistry::new();
        let (task, abort) = parked_handle().await;
        registry.insert_invoke(
            "attempt-1",
            PendingInvoke {
                state: "loading".to_string(),
                abort,
            },
        );

        registry.abort_invokes();
        assert!(task.await.unwrap_err().is_cancelled());
        // The interrupt outcome still needs to resolve its owning state.
        let pending = registry.take_invoke("attempt-1").unwrap();
        assert_eq!(pending.state, "loading");
    }
}
