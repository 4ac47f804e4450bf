//! Listener Manager (spec §4.7): registry and lifecycle of outbox, presence,
//! contact-request and ACK listeners, with suspend/resume and day-rotation.
//!
//! Lock-order rule (spec §5): the manager must never hold a class mutex
//! across a facade call that might in turn acquire the facade's own
//! listener-map mutex. Every `start`/`cancel` below follows the three-phase
//! pattern spec §4.7 mandates for the ACK listener, generalized to all four
//! classes since the contract is identical across them: (1) check/reserve
//! under the class mutex and release, (2) call the facade with no class
//! mutex held, (3) re-acquire, resolve races, record the descriptor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use engine_protocol::{DhtFacade, ListenerToken};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::EngineError;
use crate::events::{Event, EventDispatcher};

#[derive(Clone, Debug)]
struct Descriptor {
    token: ListenerToken,
    active: bool,
    day_bucket: Option<u32>,
    /// The DHT record-key string this descriptor's `token` was minted for.
    /// `resubscribe_all` re-derives the fresh token for this exact key from
    /// the facade's `(key, token)` remapping rather than trusting the stale
    /// value above.
    dht_key: String,
}

/// One registry per listener class (spec §4.7), independently mutexed and
/// independently capacity-bounded.
struct ListenerClass {
    descriptors: Mutex<HashMap<String, Descriptor>>,
    max: usize,
}

impl ListenerClass {
    fn new(max: usize) -> Self {
        Self { descriptors: Mutex::new(HashMap::new()), max }
    }

    fn active_count(&self) -> usize {
        self.descriptors.lock().values().filter(|d| d.active).count()
    }

    fn snapshot_keys(&self) -> Vec<String> {
        self.descriptors
            .lock()
            .iter()
            .filter(|(_, d)| d.active)
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// Invoked with a contact's fingerprint once its ACK cursor has advanced, so
/// the caller can mark that contact's pending/sent messages `RECEIVED`. Set
/// once at bootstrap via [`ListenerManager::set_mark_received_callback`];
/// tests that don't care about message-store side effects just leave it unset.
pub type MarkReceivedFn = Arc<dyn Fn(String) + Send + Sync>;

pub struct ListenerManager {
    facade: Arc<dyn DhtFacade>,
    events: Arc<EventDispatcher>,
    outbox: ListenerClass,
    presence: ListenerClass,
    contact_request: ListenerClass,
    ack: ListenerClass,
    ack_cursors: Mutex<HashMap<String, i64>>,
    presence_cache: Mutex<HashMap<String, (bool, i64)>>,
    listeners_starting: AtomicBool,
    listeners_starting_notify: Notify,
    mark_received: Mutex<Option<MarkReceivedFn>>,
}

const MAX_PER_CLASS: usize = 4096;
const LISTEN_ALL_WAIT: Duration = Duration::from_secs(5);

impl ListenerManager {
    pub fn new(facade: Arc<dyn DhtFacade>, events: Arc<EventDispatcher>) -> Arc<Self> {
        Arc::new(Self {
            facade,
            events,
            outbox: ListenerClass::new(MAX_PER_CLASS),
            presence: ListenerClass::new(MAX_PER_CLASS),
            contact_request: ListenerClass::new(MAX_PER_CLASS),
            ack: ListenerClass::new(MAX_PER_CLASS),
            ack_cursors: Mutex::new(HashMap::new()),
            presence_cache: Mutex::new(HashMap::new()),
            listeners_starting: AtomicBool::new(false),
            listeners_starting_notify: Notify::new(),
            mark_received: Mutex::new(None),
        })
    }

    /// Install the callback `observe_ack` invokes after advancing a contact's
    /// cursor. Called once from `Engine::bootstrap` with a closure that marks
    /// that contact's pending/sent direct messages `RECEIVED` in the store.
    pub fn set_mark_received_callback(&self, f: MarkReceivedFn) {
        *self.mark_received.lock() = Some(f);
    }

    /// Generic three-phase start shared by every listener class (spec §4.7).
    async fn start_class(
        &self,
        class: &ListenerClass,
        key_id: &str,
        dht_key: String,
        on_value: engine_protocol::ValueCallback,
        on_cleanup: engine_protocol::CleanupCallback,
    ) -> Result<ListenerToken, EngineError> {
        // Phase 1: check duplicates/capacity, release the mutex before any await.
        let existing_token = {
            let descriptors = class.descriptors.lock();
            match descriptors.get(key_id) {
                Some(d) if d.active => Some(d.token),
                _ => {
                    if descriptors.len() >= class.max {
                        return Err(EngineError::Internal(format!("listener class at capacity ({})", class.max)));
                    }
                    None
                }
            }
        };

        if let Some(token) = existing_token {
            if self.facade.is_listener_active(token).await {
                return Ok(token);
            }
            // P3: stale — mark inactive so phase 3 below treats this as fresh.
            if let Some(d) = class.descriptors.lock().get_mut(key_id) {
                d.active = false;
            }
        }

        // Phase 2: call the facade with no class mutex held.
        let new_token = self.facade.listen(&dht_key, on_value, on_cleanup).await?;

        // Phase 3: re-acquire, resolve a concurrent insertion race.
        let winner = {
            let mut descriptors = class.descriptors.lock();
            match descriptors.get(key_id) {
                Some(d) if d.active => Some(d.token),
                _ => {
                    descriptors.insert(key_id.to_string(), Descriptor { token: new_token, active: true, day_bucket: None, dht_key });
                    None
                }
            }
        };

        if let Some(winning_token) = winner {
            // Someone else won the race while we were awaiting the facade;
            // cancel the subscription we just created and defer to theirs.
            let _ = self.facade.cancel_listen(new_token).await;
            return Ok(winning_token);
        }

        Ok(new_token)
    }

    async fn cancel_class(&self, class: &ListenerClass, key_id: &str) -> Result<(), EngineError> {
        let token = {
            let mut descriptors = class.descriptors.lock();
            descriptors.remove(key_id).map(|d| d.token)
        };
        if let Some(token) = token {
            self.facade.cancel_listen(token).await?;
        }
        Ok(())
    }

    async fn cancel_all_class(&self, class: &ListenerClass) {
        let tokens: Vec<ListenerToken> = {
            let mut descriptors = class.descriptors.lock();
            let tokens = descriptors.values().map(|d| d.token).collect();
            descriptors.clear();
            tokens
        };
        for token in tokens {
            let _ = self.facade.cancel_listen(token).await;
        }
    }

    // ---- Outbox listeners (DM, day-bucket rotated) ----

    pub async fn start_outbox_listener(self: Arc<Self>, my_fp: &str, contact_fp: &str) -> Result<ListenerToken, EngineError> {
        let day_bucket = engine_protocol::dht::keys::current_day_bucket();
        let owner_keypair = engine_protocol::dht::keys::dm_outbox_keypair(contact_fp, my_fp, day_bucket);
        let key = engine_protocol::dht::keys::record_key_for(&owner_keypair);

        let contact_fp_owned = contact_fp.to_string();
        let events = self.events.clone();
        let on_value: engine_protocol::ValueCallback = Arc::new(move |_value, expired| {
            if !expired {
                events.dispatch(Event::OutboxUpdated { contact_fingerprint: contact_fp_owned.clone() });
            }
            true
        });
        let on_cleanup: engine_protocol::CleanupCallback = Box::new(|| {});

        let token = self.start_class(&self.outbox, contact_fp, key, on_value, on_cleanup).await?;
        if let Some(d) = self.outbox.descriptors.lock().get_mut(contact_fp) {
            d.day_bucket = Some(day_bucket);
        }
        Ok(token)
    }

    pub async fn cancel_outbox_listener(&self, contact_fp: &str) -> Result<(), EngineError> {
        self.cancel_class(&self.outbox, contact_fp).await
    }

    /// Heartbeat-driven rotation check (spec §4.7, §4.9): restarts the
    /// listener when the UTC day bucket embedded in its key has advanced.
    pub async fn rotate_outbox_if_needed(self: Arc<Self>, my_fp: &str, contact_fp: &str) -> Result<(), EngineError> {
        let current = engine_protocol::dht::keys::current_day_bucket();
        let stale = matches!(
            self.outbox.descriptors.lock().get(contact_fp),
            Some(d) if d.day_bucket.is_some_and(|b| b != current)
        );
        if stale {
            self.cancel_outbox_listener(contact_fp).await?;
            self.start_outbox_listener(my_fp, contact_fp).await?;
        }
        Ok(())
    }

    // ---- Presence listeners ----

    pub async fn start_presence_listener(self: Arc<Self>, contact_fp: &str) -> Result<ListenerToken, EngineError> {
        let owner_keypair = engine_protocol::dht::keys::presence_keypair(contact_fp);
        let key = engine_protocol::dht::keys::record_key_for(&owner_keypair);

        let manager = self.clone();
        let fp_for_cb = contact_fp.to_string();
        let on_value: engine_protocol::ValueCallback = Arc::new(move |value, expired| {
            let now = crate::db::timestamp_now() / 1000;
            if expired {
                manager.presence_cache.lock().insert(fp_for_cb.clone(), (false, now));
            } else {
                let last_seen = value
                    .get(0..8)
                    .map(|b| i64::from_le_bytes(b.try_into().unwrap_or_default()))
                    .unwrap_or(now);
                manager.presence_cache.lock().insert(fp_for_cb.clone(), (true, last_seen));
            }
            true
        });
        let on_cleanup: engine_protocol::CleanupCallback = Box::new(|| {});

        self.start_class(&self.presence, contact_fp, key, on_value, on_cleanup).await
    }

    pub async fn cancel_presence_listener(&self, contact_fp: &str) -> Result<(), EngineError> {
        self.cancel_class(&self.presence, contact_fp).await
    }

    /// Best-effort cache lookup (spec §3 Presence Record); authoritative
    /// source is the DHT presence key, this is a convenience mirror.
    pub fn cached_presence(&self, contact_fp: &str) -> Option<(bool, i64)> {
        self.presence_cache.lock().get(contact_fp).copied()
    }

    // ---- Contact-request inbox listener (one per loaded identity) ----

    pub async fn start_contact_request_listener(self: Arc<Self>, my_fp: &str) -> Result<ListenerToken, EngineError> {
        let owner_keypair = engine_protocol::dht::keys::contact_request_inbox_keypair(my_fp);
        let key = engine_protocol::dht::keys::record_key_for(&owner_keypair);

        let events = self.events.clone();
        let on_value: engine_protocol::ValueCallback = Arc::new(move |_value, expired| {
            if !expired {
                events.dispatch(Event::ContactRequestReceived);
            }
            true
        });
        let on_cleanup: engine_protocol::CleanupCallback = Box::new(|| {});

        self.start_class(&self.contact_request, my_fp, key, on_value, on_cleanup).await
    }

    pub async fn cancel_contact_request_listener(&self, my_fp: &str) -> Result<(), EngineError> {
        self.cancel_class(&self.contact_request, my_fp).await
    }

    // ---- ACK listeners (cursor monotonicity, P4) ----

    pub async fn start_ack_listener(self: Arc<Self>, my_fp: &str, contact_fp: &str) -> Result<ListenerToken, EngineError> {
        let owner_keypair = engine_protocol::dht::keys::ack_keypair(contact_fp, my_fp);
        let key = engine_protocol::dht::keys::record_key_for(&owner_keypair);

        let manager = self.clone();
        let contact_fp_owned = contact_fp.to_string();
        let on_value: engine_protocol::ValueCallback = Arc::new(move |value, expired| {
            if expired || value.len() < 8 {
                return true;
            }
            let Ok(bytes) = value[0..8].try_into() else { return true };
            let ack_timestamp = i64::from_le_bytes(bytes);
            manager.observe_ack(&contact_fp_owned, ack_timestamp);
            true
        });
        let on_cleanup: engine_protocol::CleanupCallback = Box::new(|| {});

        self.start_class(&self.ack, contact_fp, key, on_value, on_cleanup).await
    }

    pub async fn cancel_ack_listener(&self, contact_fp: &str) -> Result<(), EngineError> {
        self.cancel_class(&self.ack, contact_fp).await
    }

    /// P4: an ACK with timestamp <= cursor is discarded silently; a strictly
    /// greater timestamp advances the cursor and emits `MessageDelivered`.
    fn observe_ack(&self, contact_fp: &str, ack_timestamp: i64) {
        let mut cursors = self.ack_cursors.lock();
        let advanced = match cursors.get(contact_fp) {
            Some(&cursor) if ack_timestamp <= cursor => false,
            _ => true,
        };
        if advanced {
            cursors.insert(contact_fp.to_string(), ack_timestamp);
            drop(cursors);
            if let Some(callback) = self.mark_received.lock().clone() {
                callback(contact_fp.to_string());
            }
            self.events.dispatch(Event::MessageDelivered {
                recipient: contact_fp.to_string(),
                seq_num: 0,
                timestamp: ack_timestamp,
            });
        }
    }

    pub fn last_known_ack(&self, contact_fp: &str) -> i64 {
        self.ack_cursors.lock().get(contact_fp).copied().unwrap_or(0)
    }

    // ---- Bulk operations ----

    /// Installs outbox + presence + ACK listeners for every contact in
    /// parallel. Guarded by `listeners_starting` + a 5s wait: a concurrent
    /// caller waits for the first to finish and returns the existing count.
    pub async fn listen_all_contacts(self: Arc<Self>, my_fp: &str, contacts: &[String]) -> usize {
        if self
            .listeners_starting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let _ = tokio::time::timeout(LISTEN_ALL_WAIT, self.listeners_starting_notify.notified()).await;
            return self.outbox.active_count();
        }

        let mut tasks = Vec::with_capacity(contacts.len() * 3);
        for contact in contacts {
            let manager = self.clone();
            let my_fp = my_fp.to_string();
            let contact = contact.clone();
            tasks.push(tokio::spawn(async move {
                let _ = manager.start_outbox_listener(&my_fp, &contact).await;
                let _ = manager.start_presence_listener(&contact).await;
                let _ = manager.start_ack_listener(&my_fp, &contact).await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }

        self.listeners_starting.store(false, Ordering::SeqCst);
        self.listeners_starting_notify.notify_waiters();
        self.outbox.active_count()
    }

    /// The set of contact fingerprints with an active outbox listener,
    /// for pause/resume intent comparisons (P8).
    pub fn active_outbox_contacts(&self) -> Vec<String> {
        self.outbox.snapshot_keys()
    }

    pub async fn suspend_all(&self) {
        self.facade.suspend_all().await;
    }

    /// Re-register every subscription the facade suspended and rewrite each
    /// class's descriptor with the token it was re-minted under (spec §4.2,
    /// §4.7): `facade.resubscribe_all` hands back each `(dht_key, new_token)`
    /// pair it brought back, and every descriptor remembers the `dht_key` it
    /// was started with, so a stale token never lingers past a pause→resume.
    pub async fn resubscribe_all(&self) -> Result<(), EngineError> {
        let remapped = self.facade.resubscribe_all().await?;
        let remap: HashMap<String, ListenerToken> = remapped.into_iter().collect();

        for class in [&self.outbox, &self.presence, &self.contact_request, &self.ack] {
            let mut descriptors = class.descriptors.lock();
            for descriptor in descriptors.values_mut() {
                if let Some(&new_token) = remap.get(&descriptor.dht_key) {
                    descriptor.token = new_token;
                }
            }
        }
        Ok(())
    }

    pub async fn cancel_all(&self) {
        self.cancel_all_class(&self.outbox).await;
        self.cancel_all_class(&self.presence).await;
        self.cancel_all_class(&self.contact_request).await;
        self.cancel_all_class(&self.ack).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_protocol::FakeDhtFacade;

    fn new_manager() -> (Arc<ListenerManager>, Arc<FakeDhtFacade>) {
        let facade = FakeDhtFacade::new();
        let events = Arc::new(EventDispatcher::new());
        (ListenerManager::new(facade.clone(), events), facade)
    }

    #[tokio::test]
    async fn resubscribe_all_refreshes_stale_descriptor_tokens() {
        let (manager, facade) = new_manager();
        manager.clone().start_presence_listener("contact-a").await.unwrap();
        assert_eq!(facade.active_listener_count(), 1);

        manager.suspend_all().await;
        assert_eq!(facade.active_listener_count(), 0);

        manager.resubscribe_all().await.unwrap();
        assert_eq!(facade.active_listener_count(), 1);

        // The descriptor must have been rewritten with the re-minted token --
        // if it still held the pre-suspend one, this would be a silent no-op
        // and the resubscribed listener would leak.
        manager.cancel_presence_listener("contact-a").await.unwrap();
        assert_eq!(facade.active_listener_count(), 0);
    }
}
