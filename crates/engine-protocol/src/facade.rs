//! The DHT Facade (spec §4.2): a uniform interface to PUT, GET, signed-PUT,
//! LISTEN/CANCEL, readiness and node-count, with a contract strong enough
//! that the engine's Listener Manager never needs to know it is Veilid on
//! the other side of the trait.
//!
//! Two implementations live here: [`VeilidDhtFacade`], which wraps a real
//! `RoutingContext`, and [`FakeDhtFacade`], an in-memory stand-in used by
//! the engine's property tests (P1-P11) so they run without a live network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::dht::DHTManager;
use crate::error::ProtocolError;

pub type ListenerToken = u64;

/// Invoked with `(value_bytes, expired)` whenever a watched key changes.
/// Returning `false` asks the facade to terminate the subscription.
pub type ValueCallback = Arc<dyn Fn(Vec<u8>, bool) -> bool + Send + Sync>;

/// Invoked exactly once, after the subscription this was registered with
/// becomes inert (post-cancel or post-suspend-without-resubscribe-yet... no:
/// suspend never fires this, only `cancel_listen` or a facade-initiated
/// termination does). Owns whatever the caller allocated for the listener.
pub type CleanupCallback = Box<dyn FnOnce() + Send>;

/// Uniform DHT interface consumed by the Listener Manager and handlers
/// (spec §4.2). Implementors must guarantee `on_cleanup` fires exactly once
/// per successful `listen`, strictly after the subscription is inert.
#[async_trait]
pub trait DhtFacade: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ProtocolError>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), ProtocolError>;
    async fn put_signed_permanent(
        &self,
        key: &str,
        value: Vec<u8>,
        value_id: u32,
        tag: &str,
    ) -> Result<(), ProtocolError>;
    async fn listen(
        &self,
        key: &str,
        on_value: ValueCallback,
        on_cleanup: CleanupCallback,
    ) -> Result<ListenerToken, ProtocolError>;
    async fn cancel_listen(&self, token: ListenerToken) -> Result<(), ProtocolError>;
    async fn is_listener_active(&self, token: ListenerToken) -> bool;
    /// Suspend every active subscription, retaining key + callback/user-data
    /// so [`resubscribe_all`](Self::resubscribe_all) can bring them all back.
    /// Does *not* invoke any `on_cleanup`.
    async fn suspend_all(&self);
    /// Re-register every subscription suspended by `suspend_all`. Tokens are
    /// re-minted, so this returns the `(key, new_token)` pairing for each one
    /// brought back; callers must refresh any descriptor that stored the old
    /// token by looking it up under its key in the returned list.
    async fn resubscribe_all(&self) -> Result<Vec<(String, ListenerToken)>, ProtocolError>;
    async fn node_count(&self) -> usize;
    async fn is_ready(&self) -> bool;
    async fn wait_for_ready(&self, timeout: Duration) -> bool;
}

struct Subscription {
    key: String,
    on_value: ValueCallback,
    on_cleanup: Mutex<Option<CleanupCallback>>,
}

struct Suspended {
    key: String,
    on_value: ValueCallback,
    on_cleanup: Option<CleanupCallback>,
}

// SAFETY-equivalent note: `Suspended` holds an `Option<CleanupCallback>` that
// is moved back out whole on resubscribe; it is never invoked while suspended.
unsafe impl Send for Suspended {}

/// Real implementation wrapping a Veilid [`DHTManager`] plus a background
/// task draining `VeilidUpdate`s into registered listener callbacks.
///
/// Matches the upstream `DHTManager`/dispatch-loop split: a single task owns
/// the update receiver and fans deliveries out to whichever tokens are
/// currently watching the key that changed.
pub struct VeilidDhtFacade {
    dht: Arc<DHTManager>,
    next_token: AtomicU64,
    subscriptions: Mutex<HashMap<ListenerToken, Subscription>>,
    key_index: Mutex<HashMap<String, Vec<ListenerToken>>>,
    suspended: Mutex<Vec<Suspended>>,
    ready: AtomicBool,
    node_count: AtomicUsize,
}

impl VeilidDhtFacade {
    /// Construct the facade and spawn its update-dispatch task.
    ///
    /// `update_rx` is the receiver taken from [`crate::node::EngineNode`] at
    /// startup; only one facade may own it per node.
    pub fn new(dht: Arc<DHTManager>, mut update_rx: tokio::sync::mpsc::Receiver<veilid_core::VeilidUpdate>) -> Arc<Self> {
        let facade = Arc::new(Self {
            dht,
            next_token: AtomicU64::new(1),
            subscriptions: Mutex::new(HashMap::new()),
            key_index: Mutex::new(HashMap::new()),
            suspended: Mutex::new(Vec::new()),
            ready: AtomicBool::new(false),
            node_count: AtomicUsize::new(0),
        });

        let dispatch_facade = facade.clone();
        tokio::spawn(async move {
            while let Some(update) = update_rx.recv().await {
                dispatch_facade.handle_update(update).await;
            }
            tracing::debug!("veilid update channel closed, facade dispatch loop exiting");
        });

        facade
    }

    async fn handle_update(self: &Arc<Self>, update: veilid_core::VeilidUpdate) {
        match update {
            veilid_core::VeilidUpdate::Attachment(attachment) => {
                let ready = attachment.public_internet_ready;
                self.ready.store(ready, Ordering::Relaxed);
            }
            veilid_core::VeilidUpdate::Network(network) => {
                self.node_count.store(network.peers.len(), Ordering::Relaxed);
            }
            veilid_core::VeilidUpdate::ValueChange(change) => {
                let key_string = change.key.to_string();
                let tokens: Vec<ListenerToken> = {
                    let index = self.key_index.lock();
                    index.get(&key_string).cloned().unwrap_or_default()
                };
                let expired = change.value.is_none();
                let bytes = change.value.map(|v| v.data().to_vec()).unwrap_or_default();
                for token in tokens {
                    let callback = {
                        let subs = self.subscriptions.lock();
                        subs.get(&token).map(|s| s.on_value.clone())
                    };
                    let Some(callback) = callback else { continue };
                    let keep_alive = callback(bytes.clone(), expired);
                    if !keep_alive {
                        let facade = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = facade.cancel_listen(token).await {
                                tracing::warn!(error = %e, "failed to cancel listener after callback returned false");
                            }
                        });
                    }
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl DhtFacade for VeilidDhtFacade {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ProtocolError> {
        self.dht.open_record(key).await?;
        self.dht.get_value(key, 0).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), ProtocolError> {
        self.dht.set_value(key, 0, value).await
    }

    async fn put_signed_permanent(
        &self,
        key: &str,
        value: Vec<u8>,
        value_id: u32,
        tag: &str,
    ) -> Result<(), ProtocolError> {
        tracing::debug!(key, value_id, tag, "writing signed-permanent value");
        self.dht.set_value(key, value_id, value).await
    }

    async fn listen(
        &self,
        key: &str,
        on_value: ValueCallback,
        on_cleanup: CleanupCallback,
    ) -> Result<ListenerToken, ProtocolError> {
        self.dht.open_record(key).await?;
        self.dht.watch_record(key, &[0]).await?;

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.lock().insert(
            token,
            Subscription {
                key: key.to_string(),
                on_value,
                on_cleanup: Mutex::new(Some(on_cleanup)),
            },
        );
        self.key_index.lock().entry(key.to_string()).or_default().push(token);
        Ok(token)
    }

    async fn cancel_listen(&self, token: ListenerToken) -> Result<(), ProtocolError> {
        let removed = self.subscriptions.lock().remove(&token);
        let Some(sub) = removed else { return Ok(()) };

        {
            let mut index = self.key_index.lock();
            if let Some(tokens) = index.get_mut(&sub.key) {
                tokens.retain(|t| *t != token);
                if tokens.is_empty() {
                    index.remove(&sub.key);
                }
            }
        }

        if let Err(e) = self.dht.cancel_watch(&sub.key).await {
            tracing::warn!(error = %e, key = %sub.key, "failed to cancel DHT watch");
        }

        if let Some(cleanup) = sub.on_cleanup.lock().take() {
            cleanup();
        }
        Ok(())
    }

    async fn is_listener_active(&self, token: ListenerToken) -> bool {
        self.subscriptions.lock().contains_key(&token)
    }

    async fn suspend_all(&self) {
        let drained: Vec<(ListenerToken, Subscription)> = {
            let mut subs = self.subscriptions.lock();
            subs.drain().collect()
        };
        self.key_index.lock().clear();

        let mut suspended = self.suspended.lock();
        for (_, sub) in drained {
            if let Err(e) = self.dht.cancel_watch(&sub.key).await {
                tracing::warn!(error = %e, key = %sub.key, "failed to release watch while suspending");
            }
            suspended.push(Suspended {
                key: sub.key,
                on_value: sub.on_value,
                on_cleanup: sub.on_cleanup.lock().take(),
            });
        }
    }

    async fn resubscribe_all(&self) -> Result<Vec<(String, ListenerToken)>, ProtocolError> {
        let entries: Vec<Suspended> = self.suspended.lock().drain(..).collect();
        let mut remapped = Vec::with_capacity(entries.len());
        for entry in entries {
            let Suspended { key, on_value, on_cleanup } = entry;
            let on_cleanup = on_cleanup.unwrap_or_else(|| Box::new(|| {}));
            let token = self.listen(&key, on_value, on_cleanup).await?;
            remapped.push((key, token));
        }
        Ok(remapped)
    }

    async fn node_count(&self) -> usize {
        self.node_count.load(Ordering::Relaxed)
    }

    async fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    async fn wait_for_ready(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.is_ready().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.is_ready().await
    }
}

/// In-memory stand-in for [`DhtFacade`], used by engine-level property tests
/// so P1-P11 run without a live Veilid network.
#[derive(Default)]
pub struct FakeDhtFacade {
    values: Mutex<HashMap<String, Vec<u8>>>,
    subscriptions: Mutex<HashMap<ListenerToken, Subscription>>,
    key_index: Mutex<HashMap<String, Vec<ListenerToken>>>,
    suspended: Mutex<Vec<Suspended>>,
    next_token: AtomicU64,
    ready: AtomicBool,
    node_count: AtomicUsize,
}

impl FakeDhtFacade {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ready: AtomicBool::new(true),
            node_count: AtomicUsize::new(4),
            next_token: AtomicU64::new(1),
            ..Default::default()
        })
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn set_node_count(&self, count: usize) {
        self.node_count.store(count, Ordering::Relaxed);
    }

    /// Test helper: simulate the network delivering a new value for `key`,
    /// invoking every listener currently watching it in registration order.
    /// A listener whose callback returns `false` is cancelled immediately.
    pub async fn push_value(&self, key: &str, value: Vec<u8>, expired: bool) {
        self.values.lock().insert(key.to_string(), value.clone());
        let tokens: Vec<ListenerToken> = {
            let index = self.key_index.lock();
            index.get(key).cloned().unwrap_or_default()
        };
        for token in tokens {
            let callback = {
                let subs = self.subscriptions.lock();
                subs.get(&token).map(|s| s.on_value.clone())
            };
            let Some(callback) = callback else { continue };
            if !callback(value.clone(), expired) {
                let _ = self.cancel_listen(token).await;
            }
        }
    }

    /// Test helper: number of distinct keys with at least one active listener.
    pub fn active_listener_count(&self) -> usize {
        self.subscriptions.lock().len()
    }
}

#[async_trait]
impl DhtFacade for FakeDhtFacade {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ProtocolError> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), ProtocolError> {
        self.values.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn put_signed_permanent(
        &self,
        key: &str,
        value: Vec<u8>,
        _value_id: u32,
        _tag: &str,
    ) -> Result<(), ProtocolError> {
        self.values.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn listen(
        &self,
        key: &str,
        on_value: ValueCallback,
        on_cleanup: CleanupCallback,
    ) -> Result<ListenerToken, ProtocolError> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.lock().insert(
            token,
            Subscription {
                key: key.to_string(),
                on_value,
                on_cleanup: Mutex::new(Some(on_cleanup)),
            },
        );
        self.key_index.lock().entry(key.to_string()).or_default().push(token);
        Ok(token)
    }

    async fn cancel_listen(&self, token: ListenerToken) -> Result<(), ProtocolError> {
        let removed = self.subscriptions.lock().remove(&token);
        let Some(sub) = removed else { return Ok(()) };
        {
            let mut index = self.key_index.lock();
            if let Some(tokens) = index.get_mut(&sub.key) {
                tokens.retain(|t| *t != token);
                if tokens.is_empty() {
                    index.remove(&sub.key);
                }
            }
        }
        if let Some(cleanup) = sub.on_cleanup.lock().take() {
            cleanup();
        }
        Ok(())
    }

    async fn is_listener_active(&self, token: ListenerToken) -> bool {
        self.subscriptions.lock().contains_key(&token)
    }

    async fn suspend_all(&self) {
        let drained: Vec<(ListenerToken, Subscription)> = {
            let mut subs = self.subscriptions.lock();
            subs.drain().collect()
        };
        self.key_index.lock().clear();
        let mut suspended = self.suspended.lock();
        for (_, sub) in drained {
            suspended.push(Suspended {
                key: sub.key,
                on_value: sub.on_value,
                on_cleanup: sub.on_cleanup.lock().take(),
            });
        }
    }

    async fn resubscribe_all(&self) -> Result<Vec<(String, ListenerToken)>, ProtocolError> {
        let entries: Vec<Suspended> = self.suspended.lock().drain(..).collect();
        let mut remapped = Vec::with_capacity(entries.len());
        for entry in entries {
            let Suspended { key, on_value, on_cleanup } = entry;
            let on_cleanup = on_cleanup.unwrap_or_else(|| Box::new(|| {}));
            let token = self.listen(&key, on_value, on_cleanup).await?;
            remapped.push((key, token));
        }
        Ok(remapped)
    }

    async fn node_count(&self) -> usize {
        self.node_count.load(Ordering::Relaxed)
    }

    async fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    async fn wait_for_ready(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.is_ready().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.is_ready().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    #[tokio::test]
    async fn listen_then_push_invokes_callback() {
        let facade = FakeDhtFacade::new();
        let received = Arc::new(StdAtomicUsize::new(0));
        let received_clone = received.clone();
        let token = facade
            .listen(
                "k1",
                Arc::new(move |_value, _expired| {
                    received_clone.fetch_add(1, Ordering::SeqCst);
                    true
                }),
                Box::new(|| {}),
            )
            .await
            .unwrap();
        facade.push_value("k1", b"hello".to_vec(), false).await;
        assert_eq!(received.load(Ordering::SeqCst), 1);
        assert!(facade.is_listener_active(token).await);
    }

    #[tokio::test]
    async fn callback_returning_false_cancels_and_invokes_cleanup() {
        let facade = FakeDhtFacade::new();
        let cleaned = Arc::new(StdAtomicUsize::new(0));
        let cleaned_clone = cleaned.clone();
        let token = facade
            .listen("k1", Arc::new(|_v, _e| false), Box::new(move || {
                cleaned_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();
        facade.push_value("k1", b"x".to_vec(), false).await;
        assert!(!facade.is_listener_active(token).await);
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn suspend_then_resubscribe_remints_token_but_keeps_callback() {
        let facade = FakeDhtFacade::new();
        let received = Arc::new(StdAtomicUsize::new(0));
        let received_clone = received.clone();
        let token = facade
            .listen(
                "k1",
                Arc::new(move |_v, _e| {
                    received_clone.fetch_add(1, Ordering::SeqCst);
                    true
                }),
                Box::new(|| {}),
            )
            .await
            .unwrap();

        facade.suspend_all().await;
        assert!(!facade.is_listener_active(token).await);

        let remapped = facade.resubscribe_all().await.unwrap();
        assert_eq!(remapped.len(), 1);
        assert_eq!(remapped[0].0, "k1");
        assert_ne!(remapped[0].1, token);
        assert_eq!(facade.active_listener_count(), 1);

        facade.push_value("k1", b"y".to_vec(), false).await;
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }
}
