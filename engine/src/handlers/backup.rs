//! Backup & background sync handlers (spec §4.6 Profile & Backup, §4.9).
//!
//! Message backup/restore and contacts/groups/GEKs/addressbook sync each run
//! as one-shot operations a caller drives from a background task; this
//! module owns the DHT read/write and local-cache bookkeeping, not the
//! scheduling (that is the Stabilization Coordinator's job, spec §4.9).

use std::sync::Arc;

use engine_protocol::dht::keys::{addressbook_keypair, message_backup_keypair, record_key_for};
use engine_protocol::{build_addressbook_record, verify_addressbook_record, AddressbookEntry, AddressbookRecord};

use crate::context::EngineContext;
use crate::db::{get_i64, get_str, get_str_opt, timestamp_now, DbPool};
use crate::db_helpers::db_call;
use crate::error::EngineError;

/// Counts returned to the typed completion callback a background sync task
/// invokes (spec §4.6): how many rows each sub-sync touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounts {
    pub messages: usize,
    pub contacts: usize,
    pub groups: usize,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct BackedUpMessage {
    id: String,
    contact_fp: Option<String>,
    group_id: Option<String>,
    sender_fp: Option<String>,
    direction: String,
    plaintext: String,
    status: i64,
    created_at: i64,
    message_type: String,
}

async fn all_messages(pool: &DbPool) -> Result<Vec<BackedUpMessage>, EngineError> {
    db_call(pool, |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, contact_fp, group_id, sender_fp, direction, plaintext, status, created_at, message_type FROM messages",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(BackedUpMessage {
                id: get_str(row, "id"),
                contact_fp: get_str_opt(row, "contact_fp"),
                group_id: get_str_opt(row, "group_id"),
                sender_fp: get_str_opt(row, "sender_fp"),
                direction: get_str(row, "direction"),
                plaintext: get_str(row, "plaintext"),
                status: get_i64(row, "status"),
                created_at: get_i64(row, "created_at"),
                message_type: get_str(row, "message_type"),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
    })
    .await
}

async fn insert_message_if_missing(pool: &DbPool, m: &BackedUpMessage) -> Result<(), EngineError> {
    let m = m.clone();
    db_call(pool, move |conn| {
        conn.execute(
            "INSERT OR IGNORE INTO messages (id, contact_fp, group_id, sender_fp, direction, plaintext, status, created_at, retry_count, message_type) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9)",
            rusqlite::params![m.id, m.contact_fp, m.group_id, m.sender_fp, m.direction, m.plaintext, m.status, m.created_at, m.message_type],
        )?;
        Ok(())
    })
    .await
}

/// Seal the full local message cache to ourselves and deposit it on our
/// backup slot. Sealed under our own ML-KEM key, the same primitive direct
/// messages use, rather than a new at-rest format.
pub async fn backup_messages(ctx: &Arc<EngineContext>) -> Result<usize, EngineError> {
    let identity = ctx.identity()?;
    let messages = all_messages(&ctx.pool).await?;
    let count = messages.len();
    let plaintext = serde_json::to_vec(&messages).map_err(|e| EngineError::Internal(e.to_string()))?;
    let sealed = engine_crypto::message::seal_for_recipient(identity.kem_encap_key(), &plaintext)?;
    let wire = serde_json::to_vec(&sealed).map_err(|e| EngineError::Internal(e.to_string()))?;

    let key = record_key_for(&message_backup_keypair(&identity.fingerprint()));
    ctx.facade.put(&key, wire).await?;
    Ok(count)
}

/// Restore the message cache from our backup slot, merging by id.
pub async fn restore_messages(ctx: &Arc<EngineContext>) -> Result<usize, EngineError> {
    let identity = ctx.identity()?;
    let key = record_key_for(&message_backup_keypair(&identity.fingerprint()));
    let Some(wire) = ctx.facade.get(&key).await? else { return Ok(0) };
    let sealed: engine_crypto::message::SealedMessage =
        serde_json::from_slice(&wire).map_err(|e| EngineError::Internal(e.to_string()))?;
    let plaintext = engine_crypto::message::open_as_recipient(&identity, &sealed)?;
    let messages: Vec<BackedUpMessage> = serde_json::from_slice(&plaintext).map_err(|e| EngineError::Internal(e.to_string()))?;

    let mut restored = 0usize;
    for m in &messages {
        insert_message_if_missing(&ctx.pool, m).await?;
        restored += 1;
    }
    Ok(restored)
}

async fn all_contact_entries(pool: &DbPool) -> Result<Vec<AddressbookEntry>, EngineError> {
    db_call(pool, |conn| {
        let mut stmt = conn.prepare("SELECT fingerprint, nickname, verifying_key, kem_public FROM contacts")?;
        let rows = stmt.query_map([], |row| {
            Ok(AddressbookEntry {
                fingerprint: get_str(row, "fingerprint"),
                nickname: get_str_opt(row, "nickname"),
                verifying_key: row.get::<_, Vec<u8>>("verifying_key")?,
                kem_public: row.get::<_, Vec<u8>>("kem_public")?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
    })
    .await
}

/// Publish the current contact list to our addressbook slot. Fire this
/// after any `add_contact`/`remove_contact` so the slot never drifts far
/// from local state (spec §4.6: "triggers an asynchronous contactlist-to-DHT
/// publish").
pub async fn publish_addressbook(ctx: &Arc<EngineContext>) -> Result<(), EngineError> {
    let identity = ctx.identity()?;
    let entries = all_contact_entries(&ctx.pool).await?;
    let record = build_addressbook_record(&identity, entries, timestamp_now())?;
    let wire = serde_json::to_vec(&record).map_err(|e| EngineError::Internal(e.to_string()))?;
    let key = record_key_for(&addressbook_keypair(&record.owner_fp));
    ctx.facade.put(&key, wire).await?;
    Ok(())
}

/// Queue an addressbook publish on the Task Queue, fire-and-forget (spec
/// §4.6) -- the caller (`contacts::add_contact`/`remove_contact`) does not
/// wait on it.
pub async fn queue_addressbook_publish(ctx: &Arc<EngineContext>) -> Result<(), EngineError> {
    let task_ctx = ctx.clone();
    let (request_id, cancelled) = ctx.registry.allocate();
    let registry = ctx.registry.clone();
    let task = crate::task_queue::Task::new(
        request_id,
        cancelled,
        move || async move {
            if let Err(e) = publish_addressbook(&task_ctx).await {
                tracing::warn!(error = %e, "addressbook publish failed");
            }
            registry.complete(request_id);
        },
        || {},
    );
    ctx.tasks.submit(task).await
}

/// Restore our own addressbook from the DHT, filing every entry as a
/// contact. Verified against the already-loaded identity's own verifying
/// key -- the record's signer and the restoring party are the same identity.
pub async fn restore_addressbook(ctx: &Arc<EngineContext>) -> Result<usize, EngineError> {
    let identity = ctx.identity()?;
    let key = record_key_for(&addressbook_keypair(&identity.fingerprint()));
    let Some(wire) = ctx.facade.get(&key).await? else { return Ok(0) };
    let record: AddressbookRecord = serde_json::from_slice(&wire).map_err(|e| EngineError::Internal(e.to_string()))?;
    verify_addressbook_record(&record, &identity.export_verifying_key())?;

    for entry in &record.entries {
        super::contacts::add_contact(ctx, &entry.fingerprint, &entry.verifying_key, &entry.kem_public, entry.nickname.as_deref()).await?;
    }
    Ok(record.entries.len())
}

/// Best-effort background sync run once the Stabilization Coordinator sees
/// the DHT routing table reach >=2 nodes (spec §4.9): restore the
/// addressbook, pull every contact's offline messages, sync every group's
/// topic record, and retry whatever outgoing mail is still `PENDING`/`SENT`
/// (spec §4.6 full-mode `load_identity`, §4.12). Each sub-step is
/// independent; one failing does not block the others.
pub async fn sync_all(ctx: &Arc<EngineContext>) -> SyncCounts {
    let contacts = restore_addressbook(ctx).await.unwrap_or(0);
    let messages = super::messaging::check_offline_messages(ctx, true).await.unwrap_or(0);
    let groups = super::groups::get_groups(ctx).await.map(|g| g.len()).unwrap_or(0);

    let send = super::messaging::delivery_send_fn(ctx.clone());
    if let Err(e) = ctx.delivery.run_retry_cycle(send).await {
        tracing::warn!(error = %e, "pending-message retry during sync_all failed");
    }

    SyncCounts { messages, contacts, groups }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::db::create_pool;
    use crate::delivery::DeliveryEngine;
    use crate::events::EventDispatcher;
    use crate::handlers::contacts::add_contact;
    use crate::identity_lock::IdentityLock;
    use crate::keystore::KeyStore;
    use crate::lifecycle::LifecycleController;
    use crate::listener_manager::ListenerManager;
    use crate::registry::RequestRegistry;
    use crate::task_queue::TaskQueue;
    use engine_crypto::Identity;
    use engine_protocol::FakeDhtFacade;
    use tempfile::TempDir;

    fn test_ctx(dir: &TempDir) -> Arc<EngineContext> {
        let config = EngineConfig::new(dir.path());
        let db = create_pool(config.db_path_for("test").to_str().unwrap()).unwrap().pool;
        let facade = FakeDhtFacade::new();
        let events = Arc::new(EventDispatcher::new());
        let listeners = ListenerManager::new(facade.clone(), events.clone());
        let registry = Arc::new(RequestRegistry::new());
        let tasks = TaskQueue::start(16, 2);
        let lifecycle = LifecycleController::new(events.clone(), listeners.clone());
        let keystore = Arc::new(KeyStore::new(dir.path()));
        let delivery = Arc::new(DeliveryEngine::new(db.clone(), facade.clone(), config.clone()));
        EngineContext::new(config, db, facade, events, listeners, registry, tasks, lifecycle, keystore, delivery)
    }

    fn load_session(ctx: &Arc<EngineContext>, dir: &TempDir, identity: Identity) {
        let fingerprint = identity.fingerprint();
        let lock = IdentityLock::acquire(&dir.path().join(".identity_lock")).unwrap();
        ctx.set_session(crate::context::Session { identity: Arc::new(identity), fingerprint, password: None, _lock: lock });
    }

    #[tokio::test]
    async fn backup_then_restore_round_trips_messages() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        let alice = Identity::generate();
        load_session(&ctx, &dir, alice);

        let bob = Identity::generate();
        add_contact(&ctx, &bob.fingerprint(), &bob.export_verifying_key(), &bob.export_kem_public(), None).await.unwrap();
        crate::handlers::messaging::send_message(&ctx, &bob.fingerprint(), "hi bob", "text").await.unwrap();

        let backed_up = backup_messages(&ctx).await.unwrap();
        assert_eq!(backed_up, 1);

        db_call(&ctx.pool, |conn| {
            conn.execute("DELETE FROM messages", [])?;
            Ok(())
        })
        .await
        .unwrap();

        let restored = restore_messages(&ctx).await.unwrap();
        assert_eq!(restored, 1);
    }

    #[tokio::test]
    async fn publish_then_restore_addressbook_round_trips() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        let alice = Identity::generate();
        load_session(&ctx, &dir, alice);

        let bob = Identity::generate();
        add_contact(&ctx, &bob.fingerprint(), &bob.export_verifying_key(), &bob.export_kem_public(), Some("Bobby")).await.unwrap();
        publish_addressbook(&ctx).await.unwrap();

        db_call(&ctx.pool, |conn| {
            conn.execute("DELETE FROM contacts", [])?;
            Ok(())
        })
        .await
        .unwrap();

        let restored = restore_addressbook(&ctx).await.unwrap();
        assert_eq!(restored, 1);
        let contacts = crate::handlers::contacts::list_contact_fingerprints(&ctx).await.unwrap();
        assert_eq!(contacts, vec![bob.fingerprint()]);
    }
}
