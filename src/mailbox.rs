//! FIFO event mailbox with re-entrant-safe draining.
//!
//! The mailbox serializes event processing: enqueuing while a drain is in
//! progress appends to the tail instead of recursing, so self-raised events
//! are processed in enqueue order with O(1) stack depth. The drain loop
//! itself lives in the actor; the mailbox only tracks the queue and whether
//! a drain is running.

use std::collections::VecDeque;

use crate::event::Event;

#[derive(Debug, Default)]
pub(crate) struct Mailbox {
    queue: VecDeque<Event>,
    draining: bool,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event. Returns true when the caller must drive the drain
    /// loop; false when a drain is already running and will pick the event
    /// up in order.
    pub fn push(&mut self, event: Event) -> bool {
        self.queue.push_back(event);
        if self.draining {
            false
        } else {
            self.draining = true;
            true
        }
    }

    /// The next event to process. Ends the drain (clearing the flag) when
    /// the queue is empty.
    pub fn next(&mut self) -> Option<Event> {
        match self.queue.pop_front() {
            Some(event) => Some(event),
            None => {
                self.draining = false;
                None
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub fn is_draining(&self) -> bool {
        self.draining
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ev(tag: &str) -> Event {
        Event::tag_only(tag)
    }

    #[test]
    fn test_first_push_starts_drain() {
        let mut mailbox = Mailbox::new();
        assert!(mailbox.push(ev("A")));
        assert!(mailbox.is_draining());
        assert!(!mailbox.push(ev("B")));
        assert_eq!(mailbox.len(), 2);
    }

    #[test]
    fn test_next_returns_fifo_and_ends_drain() {
        let mut mailbox = Mailbox::new();
        mailbox.push(ev("A"));
        mailbox.push(ev("B"));

        assert_eq!(mailbox.next().unwrap().tag(), "A");
        assert_eq!(mailbox.next().unwrap().tag(), "B");
        assert!(mailbox.is_draining());
        assert!(mailbox.next().is_none());
        assert!(!mailbox.is_draining());
    }

    #[test]
    fn test_push_mid_drain_is_appended() {
        let mut mailbox = Mailbox::new();
        mailbox.push(ev("A"));
        assert_eq!(mailbox.next().unwrap().tag(), "A");

        // Still draining: a "raised" event lands at the tail.
        assert!(!mailbox.push(ev("B")));
        assert_eq!(mailbox.next().unwrap().tag(), "B");
        assert!(mailbox.next().is_none());

        // After the drain ended, the next push starts a new one.
        assert!(mailbox.push(ev("C")));
    }

    proptest! {
        /// Simulates the actor drain loop: every processed event may raise
        /// further events, and the observed order must equal enqueue order.
        #[test]
        fn prop_drain_order_equals_enqueue_order(
            tags in proptest::collection::vec("[A-Z]{1,4}", 1..50),
            raise_at in proptest::collection::vec(any::<bool>(), 1..50),
        ) {
            let mut mailbox = Mailbox::new();
            let mut expected = Vec::new();
            let mut seen = Vec::new();

            prop_assert!(mailbox.push(ev(&tags[0])));
            expected.push(tags[0].clone());

            let mut pending: Vec<String> = tags[1..].to_vec();
            let mut raises = raise_at.into_iter();

            loop {
                // External enqueues while the drain is running.
                if let Some(tag) = pending.pop() {
                    prop_assert!(!mailbox.push(ev(&tag)));
                    expected.push(tag);
                }
                match mailbox.next() {
                    Some(event) => {
                        seen.push(event.tag().to_string());
                        // Processing may raise an event of its own.
                        if raises.next().unwrap_or(false) {
                            let raised = format!("{}R", event.tag());
                            prop_assert!(!mailbox.push(ev(&raised)));
                            expected.push(raised);
                        }
                    }
                    None => break,
                }
            }

            prop_assert_eq!(seen, expected);
        }
    }
}
