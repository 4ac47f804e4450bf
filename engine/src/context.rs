//! Shared engine context: the bundle of long-lived subsystems every handler
//! needs a reference to, plus the currently-loaded identity's session state.
//!
//! Mirrors the teacher's `AppState` (`Arc<RwLock<Option<T>>>` fields for
//! lazily-initialized subsystems, a single struct handed around as `Arc`):
//! here everything except the session is constructed once at bootstrap, and
//! only the session itself is `Option` (no identity loaded yet / unloaded).

use std::sync::Arc;

use engine_protocol::DhtFacade;
use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::db::DbPool;
use crate::delivery::DeliveryEngine;
use crate::events::EventDispatcher;
use crate::identity_lock::IdentityLock;
use crate::keystore::KeyStore;
use crate::lifecycle::LifecycleController;
use crate::listener_manager::ListenerManager;
use crate::registry::RequestRegistry;
use crate::task_queue::TaskQueue;

/// State specific to the one identity currently loaded, torn down wholesale
/// by `delete_identity`/logout. `password` is the session password used to
/// decrypt key material at rest, kept only in memory (spec §4.1) — `None`
/// means the identity's keys were stored unencrypted.
pub struct Session {
    pub identity: Arc<engine_crypto::Identity>,
    pub fingerprint: String,
    pub password: Option<String>,
    /// Held for the lifetime of the session; dropped on logout/shutdown (P10).
    pub _lock: IdentityLock,
}

/// Every subsystem a Handler Set function needs. Constructed once at
/// `Engine::bootstrap` and handed around as `Arc<EngineContext>`.
pub struct EngineContext {
    pub config: EngineConfig,
    pub pool: DbPool,
    pub facade: Arc<dyn DhtFacade>,
    pub events: Arc<EventDispatcher>,
    pub listeners: Arc<ListenerManager>,
    pub registry: Arc<RequestRegistry>,
    pub tasks: Arc<TaskQueue>,
    pub lifecycle: Arc<LifecycleController>,
    pub keystore: Arc<KeyStore>,
    pub delivery: Arc<DeliveryEngine>,
    session: Mutex<Option<Session>>,
}

impl EngineContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        pool: DbPool,
        facade: Arc<dyn DhtFacade>,
        events: Arc<EventDispatcher>,
        listeners: Arc<ListenerManager>,
        registry: Arc<RequestRegistry>,
        tasks: Arc<TaskQueue>,
        lifecycle: Arc<LifecycleController>,
        keystore: Arc<KeyStore>,
        delivery: Arc<DeliveryEngine>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            pool,
            facade,
            events,
            listeners,
            registry,
            tasks,
            lifecycle,
            keystore,
            delivery,
            session: Mutex::new(None),
        })
    }

    pub fn set_session(&self, session: Session) {
        *self.session.lock() = Some(session);
    }

    pub fn clear_session(&self) {
        *self.session.lock() = None;
    }

    pub fn identity(&self) -> Result<Arc<engine_crypto::Identity>, crate::error::EngineError> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.identity.clone())
            .ok_or(crate::error::EngineError::NoIdentity)
    }

    pub fn fingerprint(&self) -> Result<String, crate::error::EngineError> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.fingerprint.clone())
            .ok_or(crate::error::EngineError::NoIdentity)
    }

    pub fn password(&self) -> Option<String> {
        self.session.lock().as_ref().and_then(|s| s.password.clone())
    }

    pub fn has_session(&self) -> bool {
        self.session.lock().is_some()
    }
}
