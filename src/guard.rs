//! Guard predicates.
//!
//! A guard is a synchronous boolean predicate over `{context, event}` that
//! gates whether a matched transition is taken. Guards are required to be
//! side-effect free. A panicking guard blocks the transition and is
//! reported through the actor's error channel rather than crashing the
//! drain loop.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;

use crate::event::Event;

type GuardFn = Arc<dyn Fn(&Value, &Event) -> bool + Send + Sync>;

/// A transition guard.
#[derive(Clone)]
pub struct Guard {
    predicate: GuardFn,
}

impl Guard {
    pub fn new(predicate: impl Fn(&Value, &Event) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Arc::new(predicate),
        }
    }

    /// Evaluates the guard, isolating panics. `Err` carries the panic
    /// message.
    pub fn evaluate(&self, ctx: &Value, event: &Event) -> Result<bool, String> {
        catch_unwind(AssertUnwindSafe(|| (self.predicate)(ctx, event))).map_err(panic_message)
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Guard(<fn>)")
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_guard_evaluates_context() {
        let guard = Guard::new(|ctx, _| ctx["amount"].as_i64().unwrap_or(0) > 100);

        let event = Event::tag_only("PAY");
        assert_eq!(guard.evaluate(&json!({"amount": 150}), &event), Ok(true));
        assert_eq!(guard.evaluate(&json!({"amount": 50}), &event), Ok(false));
    }

    #[test]
    fn test_guard_sees_event() {
        let guard = Guard::new(|_, event| event.payload().map(|p| p["force"] == true).unwrap_or(false));

        assert_eq!(
            guard.evaluate(&json!({}), &Event::user("GO", json!({"force": true}))),
            Ok(true)
        );
        assert_eq!(guard.evaluate(&json!({}), &Event::tag_only("GO")), Ok(false));
    }

    #[test]
    fn test_panicking_guard_is_isolated() {
        let guard = Guard::new(|_, _| panic!("boom"));
        let result = guard.evaluate(&json!({}), &Event::tag_only("GO"));
        assert_eq!(result, Err("boom".to_string()));
    }
}
