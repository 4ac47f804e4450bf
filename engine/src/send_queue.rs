//! Message Send Queue (spec §4.11): a bounded, resizable slot table backing
//! `queue_message`. The actual send is dispatched by the caller (the
//! messaging handler submits a [`crate::task_queue::Task`] carrying the slot
//! ID); this module only owns slot bookkeeping and the capacity bound (P11).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::db::timestamp_now;
use crate::error::EngineError;

pub type SlotId = u64;

pub struct QueuedSend {
    pub recipient: String,
    pub message: String,
    pub queued_at: i64,
}

/// Bounded mutex-protected slot array. Capacity may grow freely; shrinking is
/// only permitted down to the number of slots currently occupied, never
/// below (spec §4.11).
pub struct SendQueue {
    slots: Mutex<HashMap<SlotId, QueuedSend>>,
    capacity: AtomicUsize,
    next_id: AtomicU64,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        Self { slots: Mutex::new(HashMap::new()), capacity: AtomicUsize::new(capacity), next_id: AtomicU64::new(1) }
    }

    /// Reserve a slot and capture `queued_at` atomically with the reservation
    /// (spec §4.11). Fails deterministically once the queue is at capacity.
    pub fn enqueue(&self, recipient: String, message: String) -> Result<SlotId, EngineError> {
        let mut slots = self.slots.lock();
        if slots.len() >= self.capacity.load(Ordering::SeqCst) {
            return Err(EngineError::Internal("send queue is full".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        slots.insert(id, QueuedSend { recipient, message, queued_at: timestamp_now() / 1000 });
        Ok(id)
    }

    /// Free a slot once its send task has completed (success or failure).
    pub fn free(&self, id: SlotId) {
        self.slots.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Resize the bound. Growing is always allowed; shrinking below the
    /// current occupancy is rejected rather than evicting in-flight sends.
    pub fn resize(&self, new_capacity: usize) -> Result<(), EngineError> {
        let occupied = self.slots.lock().len();
        if new_capacity < occupied {
            return Err(EngineError::InvalidParam(format!(
                "cannot shrink send queue to {new_capacity}, {occupied} slots occupied"
            )));
        }
        self.capacity.store(new_capacity, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_past_capacity_is_rejected_p11() {
        let queue = SendQueue::new(2);
        queue.enqueue("a".into(), "hi".into()).unwrap();
        queue.enqueue("b".into(), "hi".into()).unwrap();
        assert!(queue.enqueue("c".into(), "hi".into()).is_err());
    }

    #[test]
    fn freeing_a_slot_makes_room() {
        let queue = SendQueue::new(1);
        let id = queue.enqueue("a".into(), "hi".into()).unwrap();
        assert!(queue.enqueue("b".into(), "hi".into()).is_err());
        queue.free(id);
        assert!(queue.enqueue("b".into(), "hi".into()).is_ok());
    }

    #[test]
    fn shrink_below_occupancy_is_rejected() {
        let queue = SendQueue::new(4);
        queue.enqueue("a".into(), "hi".into()).unwrap();
        queue.enqueue("b".into(), "hi".into()).unwrap();
        assert!(queue.resize(1).is_err());
        assert!(queue.resize(2).is_ok());
    }

    #[test]
    fn grow_is_always_allowed() {
        let queue = SendQueue::new(1);
        queue.enqueue("a".into(), "hi".into()).unwrap();
        queue.resize(100).unwrap();
        assert!(queue.enqueue("b".into(), "hi".into()).is_ok());
    }
}
