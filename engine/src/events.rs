//! Event Dispatcher (spec §4.3) and the typed event stream (spec §6).

use std::sync::Arc;

use parking_lot::Mutex;

/// Tagged event the engine publishes to its single registered subscriber.
/// Ordering: events from one listener are totally ordered; events across
/// listeners are only partially ordered (spec §3 Event).
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    IdentityLoaded { fingerprint: String },
    MessageSent { message_id: String, new_status: i64 },
    MessageDelivered { recipient: String, seq_num: u64, timestamp: i64 },
    OutboxUpdated { contact_fingerprint: String },
    ContactRequestReceived,
    EnginePaused,
    EngineResumed,
    NetworkChanged { node_count: usize },
    GroupUpdated { group_id: String },
}

type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;

/// A single slot storing an event callback, guarded by a mutex. `dispatch`
/// takes the lock, clones the callback out, releases, then invokes — so the
/// dispatcher never invokes a subscriber while holding the lock (spec §4.3).
#[derive(Default)]
pub struct EventDispatcher {
    subscriber: Mutex<Option<EventCallback>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        *self.subscriber.lock() = Some(Arc::new(callback));
    }

    pub fn unsubscribe(&self) {
        *self.subscriber.lock() = None;
    }

    /// Dispatching from any task is permitted; sub-second delivery is not
    /// guaranteed.
    pub fn dispatch(&self, event: Event) {
        let callback = self.subscriber.lock().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dispatch_invokes_subscriber() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        dispatcher.subscribe(move |_event| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        dispatcher.dispatch(Event::ContactRequestReceived);
        dispatcher.dispatch(Event::EnginePaused);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dispatch_without_subscriber_is_noop() {
        let dispatcher = EventDispatcher::new();
        dispatcher.dispatch(Event::EngineResumed);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        dispatcher.subscribe(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        dispatcher.unsubscribe();
        dispatcher.dispatch(Event::EnginePaused);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
