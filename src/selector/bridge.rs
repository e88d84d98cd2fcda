//! Hand-off of event batches from the poll thread to the dispatch thread.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::Event;

/// What a bridge turn delivered to the dispatch thread.
pub(crate) enum Turn {
    /// A batch of kernel events.
    Batch(Vec<Event>),
    /// No events, but reply records, drain notices or timers may be pending.
    Kick,
}

struct State {
    batches: VecDeque<Vec<Event>>,
    kicks: u32,
    shutdown: bool,
}

/// The one object the poll thread publishes events through.
///
/// A single mutex guards the state; the consumer blocks on the condvar and
/// is the only thread that takes batches out. Wakers are never woken from
/// here, so holding the lock around the condvar signal is safe.
pub(crate) struct EventBridge {
    state: Mutex<State>,
    consumer: Condvar,
}

impl EventBridge {
    pub(crate) fn new() -> EventBridge {
        EventBridge {
            state: Mutex::new(State {
                batches: VecDeque::new(),
                kicks: 0,
                shutdown: false,
            }),
            consumer: Condvar::new(),
        }
    }

    /// Poll-thread side: publishes a batch, waking the consumer if it is
    /// blocked. Dropped silently after shutdown.
    pub(crate) fn push(&self, batch: Vec<Event>) {
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return;
        }
        state.batches.push_back(batch);
        self.consumer.notify_one();
    }

    /// Nudges the consumer without a batch: reply records, drain notices or
    /// due timers are waiting in their queues.
    pub(crate) fn kick(&self) {
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            return;
        }
        state.kicks += 1;
        self.consumer.notify_one();
    }

    /// Consumer side: blocks for the next turn; `None` once shut down.
    pub(crate) fn next(&self) -> Option<Turn> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(batch) = state.batches.pop_front() {
                return Some(Turn::Batch(batch));
            }
            if state.kicks > 0 {
                state.kicks = 0;
                return Some(Turn::Kick);
            }
            state = self.consumer.wait(state).unwrap();
        }
    }

    /// Ends the hand-off; a blocked consumer observes `None`.
    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        self.consumer.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventFlags;
    use crate::{Event, Interest, RegistrationId};

    fn event() -> Event {
        Event::new(
            RegistrationId::new(1, 1),
            Interest::READABLE,
            EventFlags::empty(),
        )
    }

    #[test]
    fn buffered_batch_returned_immediately() {
        let bridge = EventBridge::new();
        bridge.push(vec![event()]);
        match bridge.next() {
            Some(Turn::Batch(batch)) => assert_eq!(batch.len(), 1),
            _ => panic!("expected a batch"),
        }
    }

    #[test]
    fn shutdown_returns_none_and_drops_pushes() {
        let bridge = EventBridge::new();
        bridge.shutdown();
        bridge.push(vec![event()]);
        assert!(bridge.next().is_none());
    }

    #[test]
    fn kick_wakes_without_batch() {
        let bridge = EventBridge::new();
        bridge.kick();
        assert!(matches!(bridge.next(), Some(Turn::Kick)));
    }

    #[test]
    fn shutdown_unblocks_waiting_consumer() {
        use std::sync::Arc;

        let bridge = Arc::new(EventBridge::new());
        let consumer = {
            let bridge = bridge.clone();
            std::thread::spawn(move || bridge.next().is_none())
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        bridge.shutdown();
        assert!(consumer.join().unwrap());
    }
}
