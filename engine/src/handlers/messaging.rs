//! Direct-message handlers (spec §4.6/§4.8).
//!
//! Sending and receiving both deposit/read raw envelopes through
//! [`EngineContext::facade`] directly, the same pattern as
//! [`super::contacts`].

use std::sync::Arc;

use engine_crypto::Identity;
use engine_protocol::dht::keys::{current_day_bucket, dm_outbox_keypair, record_key_for};
use engine_protocol::messaging::envelope;
use engine_protocol::messaging::MessagePayload;

use crate::context::EngineContext;
use crate::db::{get_i64, get_str, get_str_opt, timestamp_now, DbPool};
use crate::db_helpers::{db_call, db_fire};
use crate::delivery::{SendFn, SendFuture, SendOutcome, STATUS_PENDING, STATUS_SENT};
use crate::error::EngineError;
use crate::events::Event;

pub struct MessageRecord {
    pub id: String,
    pub contact_fp: Option<String>,
    pub group_id: Option<String>,
    pub sender_fp: Option<String>,
    pub direction: String,
    pub plaintext: String,
    pub status: i64,
    pub created_at: i64,
    pub message_type: String,
}

/// Look up a contact's KEM public key, the precondition every send needs
/// (spec §4.8 `KEY_UNAVAILABLE`).
async fn contact_kem_public(pool: &DbPool, contact_fp: &str) -> Result<Vec<u8>, EngineError> {
    let fp = contact_fp.to_string();
    db_call(pool, move |conn| {
        conn.query_row("SELECT kem_public FROM contacts WHERE fingerprint = ?1", [fp], |row| row.get::<_, Vec<u8>>(0))
    })
    .await
    .map_err(|_| EngineError::KeyUnavailable)
}

/// Build, sign, seal and deposit a direct-message envelope; persist the
/// local copy as `PENDING` then flip to `SENT` on success (spec §4.8 steps
/// 3-6). Returns the message id.
pub async fn send_message(ctx: &Arc<EngineContext>, recipient_fp: &str, body: &str, message_type: &str) -> Result<String, EngineError> {
    let kem_public = contact_kem_public(&ctx.pool, recipient_fp).await?;
    let recipient_kem = Identity::kem_public_from_bytes(&kem_public)?;

    let identity = ctx.identity()?;
    let my_fp = identity.fingerprint();
    let now_ms = timestamp_now();

    let message_id = uuid::Uuid::new_v4().to_string();
    insert_outgoing(&ctx.pool, &message_id, recipient_fp, body, message_type, now_ms / 1000).await?;

    let outcome = deposit_direct_message(&identity, &ctx.facade, &my_fp, recipient_fp, &recipient_kem, now_ms, body, message_type).await;
    match outcome {
        SendOutcome::Sent | SendOutcome::Duplicate => {
            mark_status(&ctx.pool, &message_id, STATUS_SENT).await?;
            ctx.events.dispatch(Event::MessageSent { message_id: message_id.clone(), new_status: STATUS_SENT });
        }
        SendOutcome::KeyUnavailable => return Err(EngineError::KeyUnavailable),
        SendOutcome::Failed => {
            // Left at PENDING; the Delivery Engine's retry cycle picks it up.
        }
    }

    Ok(message_id)
}

async fn deposit_direct_message(
    identity: &Identity,
    facade: &Arc<dyn engine_protocol::DhtFacade>,
    my_fp: &str,
    recipient_fp: &str,
    recipient_kem: &ml_kem::kem::EncapsulationKey<ml_kem::MlKem768>,
    timestamp_ms: u64,
    body: &str,
    message_type: &str,
) -> SendOutcome {
    let envelope = match envelope::build_direct_message(identity, timestamp_ms, recipient_kem, body, message_type) {
        Ok(e) => e,
        Err(_) => return SendOutcome::Failed,
    };
    let wire = match serde_json::to_vec(&envelope) {
        Ok(w) => w,
        Err(_) => return SendOutcome::Failed,
    };

    let owner = dm_outbox_keypair(my_fp, recipient_fp, current_day_bucket());
    let key = record_key_for(&owner);
    match facade.put(&key, wire).await {
        Ok(()) => SendOutcome::Sent,
        Err(_) => SendOutcome::Failed,
    }
}

async fn insert_outgoing(pool: &DbPool, id: &str, contact_fp: &str, body: &str, message_type: &str, created_at: i64) -> Result<(), EngineError> {
    let id = id.to_string();
    let contact_fp = contact_fp.to_string();
    let body = body.to_string();
    let message_type = message_type.to_string();
    db_call(pool, move |conn| {
        conn.execute(
            "INSERT INTO messages (id, contact_fp, group_id, sender_fp, direction, plaintext, status, created_at, retry_count, message_type) \
             VALUES (?1, ?2, NULL, NULL, 'outgoing', ?3, ?4, ?5, 0, ?6)",
            rusqlite::params![id, contact_fp, body, STATUS_PENDING, created_at, message_type],
        )?;
        Ok(())
    })
    .await
}

async fn mark_status(pool: &DbPool, id: &str, status: i64) -> Result<(), EngineError> {
    let id = id.to_string();
    db_call(pool, move |conn| {
        conn.execute("UPDATE messages SET status = ?1 WHERE id = ?2", rusqlite::params![status, id])?;
        Ok(())
    })
    .await
}

/// Mark every `PENDING`/`SENT` outgoing message to `contact_fp` as
/// `RECEIVED`, driven by the Listener Manager's ACK cursor advancing (spec
/// §4.7). Fire-and-forget: there is no request awaiting this completion.
pub fn mark_delivered(pool: &DbPool, contact_fp: &str) {
    let contact_fp = contact_fp.to_string();
    db_fire(pool, "mark_delivered", move |conn| {
        conn.execute(
            "UPDATE messages SET status = ?1 WHERE direction = 'outgoing' AND group_id IS NULL AND contact_fp = ?2 AND status IN (?3, ?4)",
            rusqlite::params![crate::delivery::STATUS_RECEIVED, contact_fp, STATUS_PENDING, STATUS_SENT],
        )?;
        Ok(())
    });
}

/// Build the [`SendFn`] the Delivery Engine's retry cycle drives (spec §4.8).
pub fn delivery_send_fn(ctx: Arc<EngineContext>) -> SendFn {
    Arc::new(move |contact_fp: String, plaintext: String| -> SendFuture {
        let ctx = ctx.clone();
        Box::pin(async move {
            let kem_public = match contact_kem_public(&ctx.pool, &contact_fp).await {
                Ok(bytes) => bytes,
                Err(_) => return SendOutcome::KeyUnavailable,
            };
            let recipient_kem = match Identity::kem_public_from_bytes(&kem_public) {
                Ok(k) => k,
                Err(_) => return SendOutcome::Failed,
            };
            let identity = match ctx.identity() {
                Ok(i) => i,
                Err(_) => return SendOutcome::Failed,
            };
            let my_fp = identity.fingerprint();
            deposit_direct_message(&identity, &ctx.facade, &my_fp, &contact_fp, &recipient_kem, timestamp_now(), &plaintext, "text").await
        })
    })
}

/// Page through a conversation, newest first, `before` exclusive.
pub async fn get_conversation(ctx: &Arc<EngineContext>, contact_fp: &str, before: i64, limit: u32) -> Result<Vec<MessageRecord>, EngineError> {
    let fp = contact_fp.to_string();
    let before = if before <= 0 { i64::MAX } else { before };
    db_call(&ctx.pool, move |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, contact_fp, group_id, sender_fp, direction, plaintext, status, created_at, message_type \
             FROM messages WHERE contact_fp = ?1 AND created_at < ?2 ORDER BY created_at DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(rusqlite::params![fp, before, limit], |row| {
            Ok(MessageRecord {
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

/// Queue a message for background send through the Task Queue + Send Queue
/// (spec §4.11). Returns the allocated slot id.
pub async fn queue_message(ctx: &Arc<EngineContext>, send_queue: &Arc<crate::send_queue::SendQueue>, recipient_fp: &str, body: &str) -> Result<crate::send_queue::SlotId, EngineError> {
    let slot_id = send_queue.enqueue(recipient_fp.to_string(), body.to_string())?;

    let ctx = ctx.clone();
    let queue = send_queue.clone();
    let recipient_fp = recipient_fp.to_string();
    let body = body.to_string();
    let (request_id, cancelled) = ctx.registry.allocate();
    let registry = ctx.registry.clone();

    let task = crate::task_queue::Task::new(
        request_id,
        cancelled,
        move || async move {
            if let Err(e) = send_message(&ctx, &recipient_fp, &body, "text").await {
                tracing::warn!(error = %e, recipient_fp, "queued send failed");
            }
            queue.free(slot_id);
            registry.complete(request_id);
        },
        move || {
            queue.free(slot_id);
        },
    );
    ctx.tasks.submit(task).await?;
    Ok(slot_id)
}

/// Poll every contact's current-day outbox to us, deposit new incoming
/// messages, and optionally publish an ACK cursor update (spec §4.8 P4).
///
/// Diffs each contact's incoming-message count before/after its fetch and
/// emits `OutboxUpdated` for any contact whose count increased, per spec
/// §4.6 step (iii).
pub async fn check_offline_messages(ctx: &Arc<EngineContext>, publish_acks: bool) -> Result<usize, EngineError> {
    let my_fp = ctx.fingerprint()?;
    let identity = ctx.identity()?;
    let contacts = super::contacts::list_contact_fingerprints(ctx).await?;
    let day_bucket = current_day_bucket();
    let mut received = 0usize;

    for contact_fp in contacts {
        let owner = dm_outbox_keypair(&contact_fp, &my_fp, day_bucket);
        let key = record_key_for(&owner);
        let Ok(Some(raw)) = ctx.facade.get(&key).await else { continue };

        let verifying_key = verifying_key_for(&ctx.pool, &contact_fp).await;
        let Some(verifying_key) = verifying_key else { continue };

        let Ok(envelope) = engine_protocol::messaging::process_incoming(&raw, &verifying_key) else { continue };
        let Ok(payload) = engine_protocol::messaging::open(&identity, &envelope) else { continue };
        let MessagePayload::DirectMessage { body, message_type } = payload else { continue };

        let before = incoming_count_for(&ctx.pool, &contact_fp).await;
        let id = uuid::Uuid::new_v4().to_string();
        let created_at = (envelope.timestamp_ms / 1000) as i64;
        insert_incoming(&ctx.pool, &id, &contact_fp, &envelope.sender_fp, &body, &message_type, created_at).await?;
        received += 1;

        let after = incoming_count_for(&ctx.pool, &contact_fp).await;
        if after > before {
            ctx.events.dispatch(Event::OutboxUpdated { contact_fingerprint: contact_fp.clone() });
        }

        if publish_acks {
            let ack_owner = engine_protocol::dht::keys::ack_keypair(&my_fp, &contact_fp);
            let ack_key = record_key_for(&ack_owner);
            let now = timestamp_now();
            let _ = ctx.facade.put(&ack_key, now.to_le_bytes().to_vec()).await;
        }
    }

    Ok(received)
}

async fn incoming_count_for(pool: &DbPool, contact_fp: &str) -> i64 {
    let fp = contact_fp.to_string();
    db_call(pool, move |conn| {
        conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE contact_fp = ?1 AND direction = 'incoming'",
            [fp],
            |row| row.get::<_, i64>(0),
        )
    })
    .await
    .unwrap_or(0)
}

async fn verifying_key_for(pool: &DbPool, contact_fp: &str) -> Option<Vec<u8>> {
    let fp = contact_fp.to_string();
    db_call(pool, move |conn| {
        conn.query_row("SELECT verifying_key FROM contacts WHERE fingerprint = ?1", [fp], |row| row.get::<_, Vec<u8>>(0))
    })
    .await
    .ok()
}

async fn insert_incoming(pool: &DbPool, id: &str, contact_fp: &str, sender_fp: &str, body: &str, message_type: &str, created_at: i64) -> Result<(), EngineError> {
    let id = id.to_string();
    let contact_fp = contact_fp.to_string();
    let sender_fp = sender_fp.to_string();
    let body = body.to_string();
    let message_type = message_type.to_string();
    db_call(pool, move |conn| {
        conn.execute(
            "INSERT INTO messages (id, contact_fp, group_id, sender_fp, direction, plaintext, status, created_at, retry_count, message_type) \
             VALUES (?1, ?2, NULL, ?3, 'incoming', ?4, ?5, ?6, 0, ?7)",
            rusqlite::params![id, contact_fp, sender_fp, body, crate::delivery::STATUS_RECEIVED, created_at, message_type],
        )?;
        Ok(())
    })
    .await
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
    async fn send_to_unknown_contact_is_key_unavailable() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        load_session(&ctx, &dir, Identity::generate());

        let err = send_message(&ctx, "nobody", "hi", "text").await.unwrap_err();
        assert!(matches!(err, EngineError::KeyUnavailable));
    }

    #[tokio::test]
    async fn send_then_fetch_conversation_round_trips() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        load_session(&ctx, &dir, Identity::generate());

        let bob = Identity::generate();
        add_contact(&ctx, &bob.fingerprint(), &bob.export_verifying_key(), &bob.export_kem_public(), None).await.unwrap();

        let id = send_message(&ctx, &bob.fingerprint(), "hello bob", "text").await.unwrap();
        let conversation = get_conversation(&ctx, &bob.fingerprint(), 0, 10).await.unwrap();
        assert_eq!(conversation.len(), 1);
        assert_eq!(conversation[0].id, id);
        assert_eq!(conversation[0].status, STATUS_SENT);
    }

    #[tokio::test]
    async fn check_offline_messages_pulls_outbox_into_local_cache() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        let alice = Identity::generate();
        let alice_fp = alice.fingerprint();
        load_session(&ctx, &dir, alice);

        let bob = Identity::generate();
        add_contact(&ctx, &bob.fingerprint(), &bob.export_verifying_key(), &bob.export_kem_public(), None).await.unwrap();

        let alice_kem = ctx.identity().unwrap().kem_encap_key().clone();
        let envelope = envelope::build_direct_message(&bob, timestamp_now(), &alice_kem, "hi alice", "text").unwrap();
        let wire = serde_json::to_vec(&envelope).unwrap();
        let key = record_key_for(&dm_outbox_keypair(&bob.fingerprint(), &alice_fp, current_day_bucket()));
        ctx.facade.put(&key, wire).await.unwrap();

        let received = check_offline_messages(&ctx, false).await.unwrap();
        assert_eq!(received, 1);

        let conversation = get_conversation(&ctx, &bob.fingerprint(), 0, 10).await.unwrap();
        assert_eq!(conversation.len(), 1);
        assert_eq!(conversation[0].plaintext, "hi alice");
        assert_eq!(conversation[0].direction, "incoming");
    }
}
