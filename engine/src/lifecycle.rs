//! Lifecycle Controller (spec §4.10): UNLOADED / ACTIVE / PAUSED states and
//! the pause/resume/network-changed/shutdown transitions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::EngineError;
use crate::events::{Event, EventDispatcher};
use crate::heartbeat::Heartbeat;
use crate::listener_manager::ListenerManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Unloaded,
    Active,
    Paused,
}

/// State transitions are taken under `state` (spec §5: state-mutex outranks
/// listener-class mutexes). A `resume` spawns a background task tracked by
/// `resume_running` + `resume_done`, so `shutdown` can wait for it to finish
/// before tearing down listeners.
pub struct LifecycleController {
    state: Mutex<EngineState>,
    events: Arc<EventDispatcher>,
    listeners: Arc<ListenerManager>,
    heartbeat: Mutex<Option<Arc<Heartbeat>>>,
    resume_running: AtomicBool,
    resume_done: Notify,
    shutdown_requested: AtomicBool,
}

impl LifecycleController {
    pub fn new(events: Arc<EventDispatcher>, listeners: Arc<ListenerManager>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EngineState::Unloaded),
            events,
            listeners,
            heartbeat: Mutex::new(None),
            resume_running: AtomicBool::new(false),
            resume_done: Notify::new(),
            shutdown_requested: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    pub fn is_paused(&self) -> bool {
        self.state() == EngineState::Paused
    }

    pub fn set_active(&self) {
        *self.state.lock() = EngineState::Active;
    }

    pub fn attach_heartbeat(&self, heartbeat: Arc<Heartbeat>) {
        *self.heartbeat.lock() = Some(heartbeat);
    }

    /// ACTIVE -> PAUSED: clears `presence_active`, suspends all listeners
    /// (descriptors retained, not destroyed), sets state.
    pub async fn pause(&self) -> Result<(), EngineError> {
        {
            let mut state = self.state.lock();
            if *state != EngineState::Active {
                return Err(EngineError::InvalidParam("engine is not active".into()));
            }
            *state = EngineState::Paused;
        }
        if let Some(heartbeat) = self.heartbeat.lock().clone() {
            heartbeat.pause();
        }
        self.listeners.suspend_all().await;
        self.events.dispatch(Event::EnginePaused);
        Ok(())
    }

    /// PAUSED -> ACTIVE: sets state, resumes presence, spawns a background
    /// task that resubscribes listeners and retries pending messages. Callers
    /// wanting the resubscribe to be done (e.g. tests checking P8) should
    /// await [`Self::wait_for_resume`].
    pub async fn resume<F, Fut>(self: &Arc<Self>, retry_pending: F) -> Result<(), EngineError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        {
            let mut state = self.state.lock();
            if *state != EngineState::Paused {
                return Err(EngineError::InvalidParam("engine is not paused".into()));
            }
            *state = EngineState::Active;
        }
        if let Some(heartbeat) = self.heartbeat.lock().clone() {
            heartbeat.resume();
        }
        self.events.dispatch(Event::EngineResumed);

        self.resume_running.store(true, Ordering::SeqCst);
        let controller = self.clone();
        tokio::spawn(async move {
            let _ = controller.listeners.resubscribe_all().await;
            retry_pending().await;
            controller.resume_running.store(false, Ordering::SeqCst);
            controller.resume_done.notify_waiters();
        });
        Ok(())
    }

    pub async fn wait_for_resume(&self) {
        while self.resume_running.load(Ordering::SeqCst) {
            self.resume_done.notified().await;
        }
    }

    /// Cancels the engine's own listener registries (stale tokens from the
    /// old DHT context would otherwise fail silently), relying on the DHT
    /// status callback to drive reconnection.
    pub async fn network_changed(&self, node_count: usize) {
        self.listeners.cancel_all().await;
        self.events.dispatch(Event::NetworkChanged { node_count });
    }

    pub async fn shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.wait_for_resume().await;
        self.listeners.cancel_all().await;
        *self.state.lock() = EngineState::Unloaded;
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_protocol::FakeDhtFacade;

    fn new_controller() -> Arc<LifecycleController> {
        let facade = FakeDhtFacade::new();
        let events = Arc::new(EventDispatcher::new());
        let listeners = ListenerManager::new(facade, events.clone());
        LifecycleController::new(events, listeners)
    }

    #[tokio::test]
    async fn pause_requires_active_state() {
        let controller = new_controller();
        assert!(controller.pause().await.is_err());
    }

    #[tokio::test]
    async fn pause_then_resume_round_trips_state() {
        let controller = new_controller();
        controller.set_active();
        controller.pause().await.unwrap();
        assert!(controller.is_paused());
        controller.resume(|| async {}).await.unwrap();
        controller.wait_for_resume().await;
        assert_eq!(controller.state(), EngineState::Active);
    }

    #[tokio::test]
    async fn resume_without_pause_is_rejected() {
        let controller = new_controller();
        controller.set_active();
        assert!(controller.resume(|| async {}).await.is_err());
    }
}
