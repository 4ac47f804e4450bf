//! The Engine (spec §2/§6): wires every subsystem together at bootstrap and
//! exposes the public API surface as one family-grouped facade.
//!
//! Mirrors the teacher's `AppState` assembly in spirit -- one function builds
//! every long-lived subsystem once and hands the result around as `Arc` --
//! but the construction order here is fixed by what each subsystem's
//! constructor actually needs from the ones before it, not by a builder.

use std::sync::Arc;
use std::time::Duration;

use engine_protocol::dht::DHTManager;
use engine_protocol::node::NodeConfig;
use engine_protocol::{DhtFacade, EngineNode, VeilidDhtFacade};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{watch, Mutex as AsyncMutex};

use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::db::create_pool;
use crate::delivery::DeliveryEngine;
use crate::error::{EngineError, EngineResult};
use crate::events::Event;
use crate::events::EventDispatcher;
use crate::handlers;
use crate::handlers::backup::SyncCounts;
use crate::handlers::contacts::{ContactView, PendingRequest};
use crate::handlers::groups::{GroupMemberInput, GroupMessageRecord, GroupView};
use crate::handlers::messaging::MessageRecord;
use crate::handlers::profile::ProfileView;
use crate::heartbeat::Heartbeat;
use crate::keystore::KeyStore;
use crate::lifecycle::LifecycleController;
use crate::listener_manager::ListenerManager;
use crate::registry::RequestRegistry;
use crate::send_queue::{SendQueue, SlotId};
use crate::stabilization::StabilizationCoordinator;
use crate::task_queue::TaskQueue;

/// The `data_dir`/db filename used before any identity has been loaded. This
/// engine's `data_dir` holds exactly one identity (see DESIGN.md), so one
/// fixed name is all bootstrap ever needs.
const BOOTSTRAP_DB_NAME: &str = "default";

/// The assembled engine: every subsystem `EngineContext` bundles, plus the
/// pieces that live above it -- the Send Queue, the Stabilization
/// Coordinator, the live Veilid node (if any), and the heartbeat's shutdown
/// signal. Constructed once via [`Engine::bootstrap`] and handed around as
/// `Arc<Engine>`.
pub struct Engine {
    ctx: Arc<EngineContext>,
    send_queue: Arc<SendQueue>,
    stabilization: Arc<StabilizationCoordinator>,
    node: AsyncMutex<Option<EngineNode>>,
    heartbeat: SyncMutex<Option<Arc<Heartbeat>>>,
    heartbeat_shutdown: watch::Sender<bool>,
    /// Synchronously-readable mirror of the contact list, refreshed on
    /// non-minimal `load_identity` and kept current by
    /// `add_contact`/`remove_contact` -- [`Heartbeat::start`] takes a
    /// synchronous closure, but listing contacts is an async DB read, so
    /// something has to bridge the two (see DESIGN.md).
    contact_cache: Arc<SyncMutex<Vec<String>>>,
}

impl Engine {
    /// Build every subsystem against a live Veilid node: start the node,
    /// wrap its routing context in a [`DHTManager`], and drive everything
    /// above that through [`VeilidDhtFacade`].
    pub async fn bootstrap(config: EngineConfig) -> EngineResult<Arc<Self>> {
        let storage_dir = config.data_dir.join("veilid").to_string_lossy().into_owned();
        let mut node = EngineNode::start(NodeConfig { storage_dir, app_namespace: "engine".into() })
            .await
            .map_err(EngineError::from)?;
        let update_rx = node.take_update_receiver().expect("update receiver is available immediately after start");
        let dht = Arc::new(DHTManager::new(node.routing_context().clone()));
        let facade = VeilidDhtFacade::new(dht, update_rx);

        Self::bootstrap_with_facade(config, facade, Some(node)).await
    }

    /// Build every subsystem against a caller-supplied facade, skipping the
    /// real Veilid node entirely when `node` is `None`. Used by embedders
    /// wanting a different facade and by the engine's own integration tests
    /// against [`engine_protocol::FakeDhtFacade`].
    pub async fn bootstrap_with_facade(config: EngineConfig, facade: Arc<dyn DhtFacade>, node: Option<EngineNode>) -> EngineResult<Arc<Self>> {
        std::fs::create_dir_all(config.db_dir()).map_err(|e| EngineError::Database(e.to_string()))?;

        let db_path = config.db_path_for(BOOTSTRAP_DB_NAME);
        let pool = create_pool(db_path.to_string_lossy().as_ref())?.pool;

        let events = Arc::new(EventDispatcher::new());
        let listeners = ListenerManager::new(facade.clone(), events.clone());
        let registry = Arc::new(RequestRegistry::new());
        let tasks = TaskQueue::start(config.task_queue_capacity, config.worker_count());
        let lifecycle = LifecycleController::new(events.clone(), listeners.clone());
        let keystore = Arc::new(KeyStore::new(config.data_dir.clone()));
        let delivery = Arc::new(DeliveryEngine::new(pool.clone(), facade.clone(), config.clone()));

        let ctx = EngineContext::new(config.clone(), pool.clone(), facade, events, listeners.clone(), registry, tasks, lifecycle, keystore, delivery);

        listeners.set_mark_received_callback(Arc::new({
            let pool = pool.clone();
            move |contact_fp: String| handlers::messaging::mark_delivered(&pool, &contact_fp)
        }));

        let send_queue = Arc::new(SendQueue::new(config.send_queue_capacity));
        let stabilization = StabilizationCoordinator::new();
        let (heartbeat_shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            ctx,
            send_queue,
            stabilization,
            node: AsyncMutex::new(node),
            heartbeat: SyncMutex::new(None),
            heartbeat_shutdown,
            contact_cache: Arc::new(SyncMutex::new(Vec::new())),
        }))
    }

    // ---- Identity ----

    #[allow(clippy::too_many_arguments)]
    pub async fn create_identity(
        &self,
        name: &str,
        signing_seed: &[u8; 32],
        enc_seed: &[u8; 32],
        master_seed: &[u8; 32],
        mnemonic: &str,
        password: Option<&str>,
    ) -> EngineResult<String> {
        handlers::identity::create_identity(&self.ctx, name, signing_seed, enc_seed, master_seed, mnemonic, password).await
    }

    /// Loads the identity and, unless `minimal`, brings the engine fully
    /// online: starts every contact's listeners (via
    /// [`handlers::identity::load_identity`]), refreshes the contact cache
    /// the heartbeat reads from, and starts the presence heartbeat and
    /// Stabilization Coordinator.
    pub async fn load_identity(self: &Arc<Self>, password: Option<&str>, minimal: bool) -> EngineResult<String> {
        let fingerprint = handlers::identity::load_identity(&self.ctx, password, minimal).await?;

        if !minimal {
            let contacts = handlers::contacts::list_contact_fingerprints(&self.ctx).await?;
            *self.contact_cache.lock() = contacts;

            let shutdown_rx = self.heartbeat_shutdown.subscribe();
            let contact_cache = self.contact_cache.clone();
            let heartbeat = Arc::new(Heartbeat::start(
                self.ctx.facade.clone(),
                self.ctx.listeners.clone(),
                fingerprint.clone(),
                move || contact_cache.lock().clone(),
                Duration::from_secs(self.ctx.config.heartbeat_period_secs),
                shutdown_rx,
            ));
            self.ctx.lifecycle.attach_heartbeat(heartbeat.clone());
            *self.heartbeat.lock() = Some(heartbeat);

            let ctx = self.ctx.clone();
            self.stabilization.spawn(self.ctx.facade.clone(), self.ctx.config.stabilization_timeout_secs, move || async move {
                handlers::backup::sync_all(&ctx).await;
            });
        }

        Ok(fingerprint)
    }

    pub fn delete_identity(&self, fingerprint: &str) -> Vec<String> {
        handlers::identity::delete_identity(&self.ctx, fingerprint)
    }

    pub fn change_password(&self, old: Option<&str>, new: Option<&str>) -> EngineResult<()> {
        handlers::identity::change_password(&self.ctx, old, new)
    }

    // ---- Contacts ----

    pub async fn list_contacts(&self) -> EngineResult<Vec<ContactView>> {
        handlers::contacts::list_contacts(&self.ctx).await
    }

    pub async fn display_name(&self, fingerprint: &str) -> EngineResult<String> {
        handlers::contacts::display_name(&self.ctx, fingerprint).await
    }

    pub async fn send_contact_request(&self, recipient_fp: &str, message: &str) -> EngineResult<()> {
        handlers::contacts::send_contact_request(&self.ctx, recipient_fp, message).await
    }

    pub async fn accept_contact_request(&self, fingerprint: &str) -> EngineResult<()> {
        handlers::contacts::accept_contact_request(&self.ctx, fingerprint).await?;
        self.contact_cache.lock().push(fingerprint.to_string());
        Ok(())
    }

    pub async fn reject_contact_request(&self, fingerprint: &str) -> EngineResult<()> {
        handlers::contacts::reject_contact_request(&self.ctx, fingerprint).await
    }

    pub async fn handle_incoming_contact_request(&self, raw: &[u8]) -> EngineResult<()> {
        handlers::contacts::handle_incoming_contact_request(&self.ctx, raw).await
    }

    pub async fn add_contact(&self, fingerprint: &str, verifying_key: &[u8], kem_public: &[u8], nickname: Option<&str>) -> EngineResult<()> {
        handlers::contacts::add_contact(&self.ctx, fingerprint, verifying_key, kem_public, nickname).await?;
        let mut cache = self.contact_cache.lock();
        if !cache.iter().any(|fp| fp == fingerprint) {
            cache.push(fingerprint.to_string());
        }
        Ok(())
    }

    pub async fn remove_contact(&self, fingerprint: &str) -> EngineResult<()> {
        handlers::contacts::remove_contact(&self.ctx, fingerprint).await?;
        self.contact_cache.lock().retain(|fp| fp != fingerprint);
        Ok(())
    }

    pub async fn pending_contact_requests(&self) -> EngineResult<Vec<PendingRequest>> {
        handlers::contacts::list_pending_requests(&self.ctx).await
    }

    // ---- Messaging ----

    pub async fn send_message(&self, recipient_fp: &str, body: &str, message_type: &str) -> EngineResult<String> {
        handlers::messaging::send_message(&self.ctx, recipient_fp, body, message_type).await
    }

    pub async fn get_conversation(&self, contact_fp: &str, before: i64, limit: u32) -> EngineResult<Vec<MessageRecord>> {
        handlers::messaging::get_conversation(&self.ctx, contact_fp, before, limit).await
    }

    pub async fn queue_message(&self, recipient_fp: &str, body: &str) -> EngineResult<SlotId> {
        handlers::messaging::queue_message(&self.ctx, &self.send_queue, recipient_fp, body).await
    }

    pub async fn check_offline_messages(&self, publish_acks: bool) -> EngineResult<usize> {
        handlers::messaging::check_offline_messages(&self.ctx, publish_acks).await
    }

    pub fn send_queue_len(&self) -> usize {
        self.send_queue.len()
    }

    pub fn resize_send_queue(&self, new_capacity: usize) -> EngineResult<()> {
        self.send_queue.resize(new_capacity)
    }

    // ---- Groups ----

    pub async fn create_group(&self, name: &str, members: Vec<GroupMemberInput>) -> EngineResult<String> {
        handlers::groups::create_group(&self.ctx, name, members).await
    }

    pub async fn get_groups(&self) -> EngineResult<Vec<GroupView>> {
        handlers::groups::get_groups(&self.ctx).await
    }

    pub async fn get_group_info(&self, group_id: &str) -> EngineResult<GroupView> {
        handlers::groups::get_group_info(&self.ctx, group_id).await
    }

    pub async fn get_group_members(&self, group_id: &str) -> EngineResult<Vec<String>> {
        handlers::groups::get_group_members(&self.ctx, group_id).await
    }

    pub async fn send_group_message(&self, group_id: &str, body: &str) -> EngineResult<String> {
        handlers::groups::send_group_message(&self.ctx, group_id, body).await
    }

    pub async fn get_group_conversation(&self, group_id: &str, after: i64, limit: u32) -> EngineResult<Vec<GroupMessageRecord>> {
        handlers::groups::get_group_conversation(&self.ctx, group_id, after, limit).await
    }

    pub async fn add_group_member(&self, group_id: &str, member: GroupMemberInput) -> EngineResult<()> {
        handlers::groups::add_group_member(&self.ctx, group_id, member).await
    }

    pub async fn remove_group_member(&self, group_id: &str, fingerprint: &str) -> EngineResult<()> {
        handlers::groups::remove_group_member(&self.ctx, group_id, fingerprint).await
    }

    pub async fn accept_group_invite(&self, raw: &[u8]) -> EngineResult<String> {
        handlers::groups::accept_group_invite(&self.ctx, raw).await
    }

    // ---- Profile ----

    pub async fn get_profile(&self, fingerprint: &str) -> EngineResult<ProfileView> {
        handlers::profile::get_profile(&self.ctx, fingerprint).await
    }

    pub async fn lookup_name(&self, name: &str) -> EngineResult<Option<String>> {
        handlers::profile::lookup_name(&self.ctx, name).await
    }

    pub async fn update_profile(&self, registered_name: Option<&str>) -> EngineResult<()> {
        handlers::profile::update_profile(&self.ctx, registered_name).await
    }

    // ---- Backup ----

    pub async fn backup_messages(&self) -> EngineResult<usize> {
        handlers::backup::backup_messages(&self.ctx).await
    }

    pub async fn restore_messages(&self) -> EngineResult<usize> {
        handlers::backup::restore_messages(&self.ctx).await
    }

    pub async fn publish_addressbook(&self) -> EngineResult<()> {
        handlers::backup::publish_addressbook(&self.ctx).await
    }

    pub async fn restore_addressbook(&self) -> EngineResult<usize> {
        handlers::backup::restore_addressbook(&self.ctx).await
    }

    pub async fn sync_all(&self) -> SyncCounts {
        handlers::backup::sync_all(&self.ctx).await
    }

    // ---- Feed (out of scope, see `handlers::feed`) ----

    pub fn feed_unsupported(&self) -> EngineError {
        handlers::feed::unsupported()
    }

    // ---- Lifecycle & events ----

    pub async fn pause(&self) -> EngineResult<()> {
        self.ctx.lifecycle.pause().await
    }

    /// Resumes the engine and, once listeners have resubscribed, drives one
    /// Delivery Engine retry cycle over whatever fell `PENDING`/`SENT` while
    /// paused.
    pub async fn resume(self: &Arc<Self>) -> EngineResult<()> {
        let ctx = self.ctx.clone();
        self.ctx.lifecycle.resume(move || async move {
            let send = handlers::messaging::delivery_send_fn(ctx.clone());
            if let Err(e) = ctx.delivery.run_retry_cycle(send).await {
                tracing::warn!(error = %e, "post-resume retry cycle failed");
            }
        })
        .await
    }

    pub async fn wait_for_resume(&self) {
        self.ctx.lifecycle.wait_for_resume().await;
    }

    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.ctx.events.subscribe(callback);
    }

    pub fn unsubscribe(&self) {
        self.ctx.events.unsubscribe();
    }

    pub async fn run_retry_cycle(&self) -> EngineResult<()> {
        let send = handlers::messaging::delivery_send_fn(self.ctx.clone());
        self.ctx.delivery.run_retry_cycle(send).await
    }

    /// Stop the task queue and heartbeat, then shut the Veilid node down
    /// gracefully if one is owned here. Best-effort: a node shutdown failure
    /// is logged, not propagated, since the process is exiting either way.
    pub async fn shutdown(self: Arc<Self>) {
        self.ctx.lifecycle.shutdown().await;
        let _ = self.heartbeat_shutdown.send(true);
        self.ctx.tasks.shutdown().await;

        if let Some(node) = self.node.lock().await.take() {
            if let Err(e) = node.shutdown().await {
                tracing::warn!(error = %e, "veilid node shutdown failed");
            }
        }
    }
}
