//! Presence & Heartbeat (spec §4.9): periodic announce loop plus day-rotation
//! triggers, both driven off one polling task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use engine_protocol::DhtFacade;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::listener_manager::ListenerManager;

const WAKE_SLICE: Duration = Duration::from_secs(1);

/// A single task sleeping in 1-second slices, checking shutdown between each,
/// totalling `period` between DHT presence republishes.
pub struct Heartbeat {
    presence_active: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    pub fn start(
        facade: Arc<dyn DhtFacade>,
        listeners: Arc<ListenerManager>,
        my_fp: String,
        contacts: impl Fn() -> Vec<String> + Send + Sync + 'static,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        let presence_active = Arc::new(AtomicBool::new(true));
        let active = presence_active.clone();

        let handle = tokio::spawn(async move {
            let mut elapsed = period;
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if elapsed >= period {
                    elapsed = Duration::ZERO;
                    if active.load(Ordering::SeqCst) {
                        publish_presence(&facade, &my_fp).await;
                    }
                    for contact in contacts() {
                        let listeners = listeners.clone();
                        let my_fp = my_fp.clone();
                        tokio::spawn(async move {
                            let _ = listeners.rotate_outbox_if_needed(&my_fp, &contact).await;
                        });
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(WAKE_SLICE) => { elapsed += WAKE_SLICE; }
                    _ = shutdown.changed() => { if *shutdown.borrow() { break; } }
                }
            }
            tracing::debug!("heartbeat task exited");
        });

        Self { presence_active, handle }
    }

    pub fn pause(&self) {
        self.presence_active.store(false, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.presence_active.store(true, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.presence_active.load(Ordering::SeqCst)
    }

    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

async fn publish_presence(facade: &Arc<dyn DhtFacade>, my_fp: &str) {
    if !facade.is_ready().await {
        return;
    }
    let owner_keypair = engine_protocol::dht::keys::presence_keypair(my_fp);
    let key = engine_protocol::dht::keys::record_key_for(&owner_keypair);
    // Privacy-preserving timestamp-only payload (spec §4.9).
    let now = crate::db::timestamp_now() / 1000;
    if let Err(e) = facade.put(&key, now.to_le_bytes().to_vec()).await {
        tracing::warn!(error = %e, "presence publish failed");
    }
}
