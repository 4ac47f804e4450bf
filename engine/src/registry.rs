//! Request Registry (spec §4.5): monotonic request IDs, cancellation flags.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// `0` is reserved for "invalid" (spec §4.5); IDs are never reused within a
/// process lifetime.
pub type RequestId = u64;

pub const INVALID_REQUEST_ID: RequestId = 0;

#[derive(Default)]
pub struct RequestRegistry {
    next_id: AtomicU64,
    cancelled: Mutex<HashMap<RequestId, Arc<std::sync::atomic::AtomicBool>>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self { next_id: AtomicU64::new(1), cancelled: Mutex::new(HashMap::new()) }
    }

    /// Allocate a fresh request ID and its cancellation flag.
    pub fn allocate(&self) -> (RequestId, Arc<std::sync::atomic::AtomicBool>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        self.cancelled.lock().insert(id, flag.clone());
        (id, flag)
    }

    /// Mark a request cancelled. No-op if the ID is unknown or already completed.
    pub fn cancel(&self, id: RequestId) -> bool {
        if let Some(flag) = self.cancelled.lock().get(&id) {
            flag.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn is_cancelled(&self, id: RequestId) -> bool {
        self.cancelled
            .lock()
            .get(&id)
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Drop bookkeeping for a completed request — call exactly once, after
    /// the task's callback has run.
    pub fn complete(&self, id: RequestId) {
        self.cancelled.lock().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_and_never_zero() {
        let registry = RequestRegistry::new();
        let (a, _) = registry.allocate();
        let (b, _) = registry.allocate();
        assert_ne!(a, INVALID_REQUEST_ID);
        assert!(b > a);
    }

    #[test]
    fn cancel_marks_flag_and_is_observable() {
        let registry = RequestRegistry::new();
        let (id, flag) = registry.allocate();
        assert!(!registry.is_cancelled(id));
        assert!(registry.cancel(id));
        assert!(registry.is_cancelled(id));
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_unknown_id_is_noop() {
        let registry = RequestRegistry::new();
        assert!(!registry.cancel(999));
    }

    #[test]
    fn complete_forgets_the_request() {
        let registry = RequestRegistry::new();
        let (id, _) = registry.allocate();
        registry.complete(id);
        assert!(!registry.is_cancelled(id));
    }
}
