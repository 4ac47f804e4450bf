//! Contacts & contact-request handlers (spec §4.6/§4.7, P7).
//!
//! Every DHT write here goes through [`EngineContext::facade`] directly,
//! mirroring [`crate::heartbeat::publish_presence`], so it can be driven
//! against [`engine_protocol::FakeDhtFacade`] in tests.

use std::sync::Arc;

use engine_protocol::messaging::envelope::{self, CONTACT_REQUEST_ACCEPTED};
use engine_protocol::messaging::receiver;

use crate::context::EngineContext;
use crate::db::{get_i64, get_str, get_str_opt, timestamp_now};
use crate::db_helpers::db_call;
use crate::error::EngineError;
use crate::events::Event;

pub struct ContactView {
    pub fingerprint: String,
    pub display_name: String,
    pub nickname: Option<String>,
    pub notes: Option<String>,
    pub blocked: bool,
    pub online: bool,
    pub last_seen: i64,
}

pub struct PendingRequest {
    pub fingerprint: String,
    pub sender_name: String,
    pub message: String,
    pub received_at: i64,
}

pub async fn list_contact_fingerprints(ctx: &Arc<EngineContext>) -> Result<Vec<String>, EngineError> {
    db_call(&ctx.pool, |conn| {
        let mut stmt = conn.prepare("SELECT fingerprint FROM contacts")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>()
    })
    .await
}

pub async fn list_pending_requests(ctx: &Arc<EngineContext>) -> Result<Vec<PendingRequest>, EngineError> {
    db_call(&ctx.pool, |conn| {
        let mut stmt = conn.prepare("SELECT fingerprint, sender_name, message, received_at FROM pending_contact_requests")?;
        let rows = stmt.query_map([], |row| {
            Ok(PendingRequest {
                fingerprint: get_str(row, "fingerprint"),
                sender_name: get_str(row, "sender_name"),
                message: get_str(row, "message"),
                received_at: get_i64(row, "received_at"),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
    })
    .await
}

pub async fn list_contacts(ctx: &Arc<EngineContext>) -> Result<Vec<ContactView>, EngineError> {
    let rows = db_call(&ctx.pool, |conn| {
        let mut stmt = conn.prepare("SELECT fingerprint, nickname, notes, blocked FROM contacts")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                get_str(row, "fingerprint"),
                get_str_opt(row, "nickname"),
                get_str_opt(row, "notes"),
                get_i64(row, "blocked") != 0,
            ))
        })?;
        rows.collect::<Result<Vec<_>, _>>()
    })
    .await?;

    let mut views = Vec::with_capacity(rows.len());
    for (fingerprint, nickname, notes, blocked) in rows {
        let display_name = display_name(ctx, &fingerprint).await?;
        let (online, last_seen) = ctx.listeners.cached_presence(&fingerprint).unwrap_or((false, 0));
        views.push(ContactView { fingerprint, display_name, nickname, notes, blocked, online, last_seen });
    }
    Ok(views)
}

/// Five-level fallback (spec §4.6): nickname -> registered (DHT profile) name
/// -> keyserver-cached name -> the name the sender gave at contact-request
/// time -> the raw fingerprint. This engine has no keyserver component (an
/// external collaborator, out of scope here — see DESIGN.md), so that level
/// is skipped rather than faked.
pub async fn display_name(ctx: &Arc<EngineContext>, fingerprint: &str) -> Result<String, EngineError> {
    let fp = fingerprint.to_string();
    let nickname = db_call(&ctx.pool, {
        let fp = fp.clone();
        move |conn| conn.query_row("SELECT nickname FROM contacts WHERE fingerprint = ?1", [fp], |row| row.get::<_, Option<String>>(0))
    })
    .await
    .ok()
    .flatten();
    if let Some(nickname) = nickname.filter(|n| !n.is_empty()) {
        return Ok(nickname);
    }

    let registered_name = db_call(&ctx.pool, {
        let fp = fp.clone();
        move |conn| conn.query_row("SELECT registered_name FROM profile_cache WHERE fingerprint = ?1", [fp], |row| row.get::<_, Option<String>>(0))
    })
    .await
    .ok()
    .flatten();
    if let Some(name) = registered_name.filter(|n| !n.is_empty()) {
        return Ok(name);
    }

    // Keyserver-cached name: no keyserver in this engine, level skipped.

    let sender_name = db_call(&ctx.pool, {
        let fp = fp.clone();
        move |conn| conn.query_row("SELECT sender_name FROM pending_contact_requests WHERE fingerprint = ?1", [fp], |row| row.get::<_, String>(0))
    })
    .await
    .ok();
    if let Some(name) = sender_name.filter(|n| !n.is_empty()) {
        return Ok(name);
    }

    Ok(fp)
}

/// Deposit a signed contact-request envelope into `recipient_fp`'s inbox.
pub async fn send_contact_request(ctx: &Arc<EngineContext>, recipient_fp: &str, message: &str) -> Result<(), EngineError> {
    let identity = ctx.identity()?;
    let my_fp = identity.fingerprint();
    let envelope = envelope::build_contact_request(&identity, timestamp_now(), message, &my_fp)?;
    let wire = serde_json::to_vec(&envelope).map_err(|e| EngineError::Internal(e.to_string()))?;

    let owner = engine_protocol::dht::keys::contact_request_inbox_keypair(recipient_fp);
    let key = engine_protocol::dht::keys::record_key_for(&owner);
    ctx.facade.put(&key, wire).await?;
    Ok(())
}

/// Accept a pending contact request: file the sender as a contact, send back
/// the reciprocal `CONTACT_REQUEST_ACCEPTED` handshake (P7), and start the
/// contact's listeners.
pub async fn accept_contact_request(ctx: &Arc<EngineContext>, fingerprint: &str) -> Result<(), EngineError> {
    let fp = fingerprint.to_string();
    let (sender_name, verifying_key, kem_public) = db_call(&ctx.pool, {
        let fp = fp.clone();
        move |conn| {
            conn.query_row(
                "SELECT sender_name, verifying_key, kem_public FROM pending_contact_requests WHERE fingerprint = ?1",
                [fp],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                },
            )
        }
    })
    .await
    .map_err(|_| EngineError::NotFound(format!("pending contact request {fingerprint}")))?;

    add_contact(ctx, fingerprint, &verifying_key, &kem_public, Some(&sender_name)).await?;

    db_call(&ctx.pool, {
        let fp = fp.clone();
        move |conn| {
            conn.execute("DELETE FROM pending_contact_requests WHERE fingerprint = ?1", [fp])?;
            Ok(())
        }
    })
    .await?;

    send_contact_request(ctx, fingerprint, CONTACT_REQUEST_ACCEPTED).await?;

    let my_fp = ctx.fingerprint()?;
    ctx.listeners.clone().start_outbox_listener(&my_fp, fingerprint).await?;
    ctx.listeners.clone().start_presence_listener(fingerprint).await?;
    ctx.listeners.clone().start_ack_listener(&my_fp, fingerprint).await?;

    Ok(())
}

pub async fn reject_contact_request(ctx: &Arc<EngineContext>, fingerprint: &str) -> Result<(), EngineError> {
    let fp = fingerprint.to_string();
    db_call(&ctx.pool, move |conn| {
        conn.execute("DELETE FROM pending_contact_requests WHERE fingerprint = ?1", [fp])?;
        Ok(())
    })
    .await
}

/// Process a raw envelope delivered to our contact-request inbox (spec §4.6
/// P7): a reciprocal `CONTACT_REQUEST_ACCEPTED` handshake files the sender
/// directly as a contact (a no-op if we'd already filed them); anything else
/// is staged in `pending_contact_requests` for the user to approve or reject.
pub async fn handle_incoming_contact_request(ctx: &Arc<EngineContext>, raw: &[u8]) -> Result<(), EngineError> {
    let (envelope, _) = receiver::process_contact_request(raw)?;
    // ContactRequest envelopes carry a plaintext body, so `open` needs no
    // identity-specific key material for this kind -- a dummy identity
    // would do just as well, but the loaded one is already at hand.
    let payload = receiver::open(&ctx.identity()?, &envelope)?;

    let engine_protocol::messaging::MessagePayload::ContactRequest { message, sender_name, sender_verifying_key, sender_kem_public } = payload else {
        return Err(EngineError::Internal("expected a contact-request payload".into()));
    };

    let sender_fp = envelope.sender_fp.clone();
    let already_contact = db_call(&ctx.pool, {
        let fp = sender_fp.clone();
        move |conn| conn.query_row("SELECT 1 FROM contacts WHERE fingerprint = ?1", [fp], |row| row.get::<_, i64>(0))
    })
    .await
    .is_ok();

    if message == CONTACT_REQUEST_ACCEPTED {
        if already_contact {
            // Reciprocal handshake for a contact we already filed -- nothing more to do.
            return Ok(());
        }
        // P7: the reciprocal-approval handshake -- file the sender directly
        // as a contact rather than staging a pending request for the user.
        add_contact(ctx, &sender_fp, &sender_verifying_key, &sender_kem_public, Some(&sender_name)).await?;
        let my_fp = ctx.fingerprint()?;
        ctx.listeners.clone().start_outbox_listener(&my_fp, &sender_fp).await?;
        ctx.listeners.clone().start_presence_listener(&sender_fp).await?;
        ctx.listeners.clone().start_ack_listener(&my_fp, &sender_fp).await?;
        return Ok(());
    }

    let fp = sender_fp.clone();
    let sender_name = sender_name.clone();
    let message = message.clone();
    db_call(&ctx.pool, move |conn| {
        conn.execute(
            "INSERT OR REPLACE INTO pending_contact_requests (fingerprint, sender_name, message, verifying_key, kem_public, received_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![fp, sender_name, message, sender_verifying_key, sender_kem_public, timestamp_now() / 1000],
        )?;
        Ok(())
    })
    .await?;

    ctx.events.dispatch(Event::ContactRequestReceived);
    Ok(())
}

/// File a contact locally and publish the updated addressbook (spec §4.6:
/// "triggers an asynchronous contactlist-to-DHT publish"). The publish is
/// best-effort and queued on the Task Queue -- a session with no identity
/// loaded yet (e.g. seeding contacts before `load_identity`) simply skips it.
pub async fn add_contact(
    ctx: &Arc<EngineContext>,
    fingerprint: &str,
    verifying_key: &[u8],
    kem_public: &[u8],
    nickname: Option<&str>,
) -> Result<(), EngineError> {
    let fp = fingerprint.to_string();
    let verifying_key = verifying_key.to_vec();
    let kem_public = kem_public.to_vec();
    let nickname = nickname.map(str::to_string);
    let added_at = timestamp_now() / 1000;
    db_call(&ctx.pool, move |conn| {
        conn.execute(
            "INSERT OR REPLACE INTO contacts (fingerprint, nickname, notes, blocked, added_at, verifying_key, kem_public) \
             VALUES (?1, ?2, NULL, 0, ?3, ?4, ?5)",
            rusqlite::params![fp, nickname, added_at, verifying_key, kem_public],
        )?;
        Ok(())
    })
    .await?;

    if ctx.has_session() {
        let _ = super::backup::queue_addressbook_publish(ctx).await;
    }
    Ok(())
}

pub async fn remove_contact(ctx: &Arc<EngineContext>, fingerprint: &str) -> Result<(), EngineError> {
    let fp = fingerprint.to_string();
    ctx.listeners.cancel_outbox_listener(fingerprint).await?;
    ctx.listeners.cancel_presence_listener(fingerprint).await?;
    ctx.listeners.cancel_ack_listener(fingerprint).await?;
    db_call(&ctx.pool, move |conn| {
        conn.execute("DELETE FROM contacts WHERE fingerprint = ?1", [fp])?;
        Ok(())
    })
    .await?;

    if ctx.has_session() {
        let _ = super::backup::queue_addressbook_publish(ctx).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::db::create_pool;
    use crate::delivery::DeliveryEngine;
    use crate::events::EventDispatcher;
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
        ctx.set_session(crate::context::Session {
            identity: Arc::new(identity),
            fingerprint,
            password: None,
            _lock: lock,
        });
    }

    #[tokio::test]
    async fn display_name_falls_back_through_levels() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        let bob = Identity::generate();
        let bob_fp = bob.fingerprint();

        // Level 5: bare fingerprint, nothing on file.
        assert_eq!(display_name(&ctx, &bob_fp).await.unwrap(), bob_fp);

        // Level 4: sender_name from a pending request.
        let fp = bob_fp.clone();
        db_call(&ctx.pool, move |conn| {
            conn.execute(
                "INSERT INTO pending_contact_requests (fingerprint, sender_name, message, verifying_key, kem_public, received_at) \
                 VALUES (?1, 'Bob From Request', 'hi', X'00', X'00', 0)",
                [fp],
            )?;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(display_name(&ctx, &bob_fp).await.unwrap(), "Bob From Request");

        // Level 1: nickname beats everything below it.
        add_contact(&ctx, &bob_fp, &bob.export_verifying_key(), &bob.export_kem_public(), Some("Bobby")).await.unwrap();
        assert_eq!(display_name(&ctx, &bob_fp).await.unwrap(), "Bobby");
    }

    #[tokio::test]
    async fn accept_contact_request_files_contact_and_sends_reciprocal() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        let alice = Identity::generate();
        load_session(&ctx, &dir, alice);

        let bob = Identity::generate();
        let fp = bob.fingerprint();
        let fp2 = fp.clone();
        db_call(&ctx.pool, move |conn| {
            conn.execute(
                "INSERT INTO pending_contact_requests (fingerprint, sender_name, message, verifying_key, kem_public, received_at) \
                 VALUES (?1, 'Bob', 'hi there', ?2, ?3, 0)",
                rusqlite::params![fp2, bob.export_verifying_key(), bob.export_kem_public()],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        accept_contact_request(&ctx, &fp).await.unwrap();

        let contacts = list_contact_fingerprints(&ctx).await.unwrap();
        assert_eq!(contacts, vec![fp.clone()]);

        let key = engine_protocol::dht::keys::record_key_for(&engine_protocol::dht::keys::contact_request_inbox_keypair(&fp));
        let wire = ctx.facade.get(&key).await.unwrap().unwrap();
        let envelope: engine_protocol::messaging::MessageEnvelope = serde_json::from_slice(&wire).unwrap();
        let payload: engine_protocol::messaging::MessagePayload = serde_json::from_slice(&envelope.body).unwrap();
        match payload {
            engine_protocol::messaging::MessagePayload::ContactRequest { message, .. } => {
                assert_eq!(message, CONTACT_REQUEST_ACCEPTED);
            }
            _ => panic!("wrong payload variant"),
        }
    }

    #[tokio::test]
    async fn reciprocal_accepted_message_is_auto_approved_p7() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        let alice = Identity::generate();
        load_session(&ctx, &dir, alice);

        // Bob is not yet a contact -- this is the primary P7 path: Alice sent
        // Bob a request, Bob approved and sent back the reciprocal handshake.
        let bob = Identity::generate();
        let envelope = envelope::build_contact_request(&bob, timestamp_now(), CONTACT_REQUEST_ACCEPTED, "Bob").unwrap();
        let raw = serde_json::to_vec(&envelope).unwrap();

        handle_incoming_contact_request(&ctx, &raw).await.unwrap();

        let contacts = list_contact_fingerprints(&ctx).await.unwrap();
        assert_eq!(contacts, vec![bob.fingerprint()]);

        let pending = list_pending_requests(&ctx).await.unwrap();
        assert!(pending.is_empty(), "accepted handshake must not land in pending requests");
    }

    #[tokio::test]
    async fn handle_incoming_contact_request_stages_a_pending_entry() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        let alice = Identity::generate();
        load_session(&ctx, &dir, alice);

        let bob = Identity::generate();
        let envelope = envelope::build_contact_request(&bob, timestamp_now(), "hi", "Bob").unwrap();
        let raw = serde_json::to_vec(&envelope).unwrap();

        handle_incoming_contact_request(&ctx, &raw).await.unwrap();

        let pending = db_call(&ctx.pool, |conn| {
            conn.query_row("SELECT sender_name FROM pending_contact_requests WHERE fingerprint = ?1", [bob.fingerprint()], |row| {
                row.get::<_, String>(0)
            })
        })
        .await
        .unwrap();
        assert_eq!(pending, "Bob");
    }
}
