//! Group handlers (spec §4.6 Groups).
//!
//! Group messages ride the same envelope format as direct messages but are
//! sealed symmetrically under a shared GEK (spec §4.1) rather than per-
//! recipient ML-KEM, and are not retried by the Delivery Engine -- a group
//! topic is a single "latest value" record, not a per-recipient outbox, so
//! there is nothing to retry against (DESIGN.md Open Question #2).
//!
//! Invites ride the same contact-request inbox slot contact requests use
//! (there is no separate inbox convention for them in `dht::keys`); the
//! caller distinguishes the two by `EnvelopeKind` before deciding which
//! handler to run, same as `contacts::handle_incoming_contact_request`.

use std::sync::Arc;

use engine_crypto::Identity;
use engine_protocol::dht::keys::{contact_request_inbox_keypair, group_topic_keypair, record_key_for};
use engine_protocol::messaging::envelope;
use engine_protocol::messaging::{EnvelopeKind, GroupRosterEntry, MessagePayload};
use rand::RngCore;

use crate::context::EngineContext;
use crate::db::{get_i64, get_str, get_str_opt, timestamp_now, DbPool};
use crate::db_helpers::db_call;
use crate::error::EngineError;
use crate::events::Event;

/// One group member's identity as supplied by the caller -- mirrors
/// `contacts::add_contact`'s (fingerprint, verifying_key, kem_public) triple,
/// since a group member need not already be a direct contact.
#[derive(Debug, Clone)]
pub struct GroupMemberInput {
    pub fingerprint: String,
    pub verifying_key: Vec<u8>,
    pub kem_public: Vec<u8>,
}

pub struct GroupView {
    pub id: String,
    pub name: String,
    pub creator_fp: String,
    pub created_at: i64,
}

pub struct GroupMessageRecord {
    pub id: String,
    pub group_id: String,
    pub sender_fp: Option<String>,
    pub direction: String,
    pub plaintext: String,
    pub created_at: i64,
}

fn fresh_gek() -> [u8; 32] {
    let mut gek = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut gek);
    gek
}

fn load_gek(ctx: &Arc<EngineContext>, group_id: &str) -> Result<Option<[u8; 32]>, EngineError> {
    let Some(bytes) = ctx.keystore.load_gek(group_id, ctx.password().as_deref())? else {
        return Ok(None);
    };
    bytes
        .try_into()
        .map(Some)
        .map_err(|_| EngineError::Crypto("stored GEK has the wrong length".into()))
}

async fn insert_group(pool: &DbPool, id: &str, name: &str, creator_fp: &str, created_at: i64) -> Result<(), EngineError> {
    let id = id.to_string();
    let name = name.to_string();
    let creator_fp = creator_fp.to_string();
    db_call(pool, move |conn| {
        conn.execute(
            "INSERT OR IGNORE INTO groups (id, name, creator_fp, created_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![id, name, creator_fp, created_at],
        )?;
        Ok(())
    })
    .await
}

async fn insert_member(pool: &DbPool, group_id: &str, member: &GroupMemberInput) -> Result<(), EngineError> {
    let group_id = group_id.to_string();
    let member = member.clone();
    db_call(pool, move |conn| {
        conn.execute(
            "INSERT OR REPLACE INTO group_members (group_id, fingerprint, verifying_key, kem_public) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![group_id, member.fingerprint, member.verifying_key, member.kem_public],
        )?;
        Ok(())
    })
    .await
}

async fn delete_member(pool: &DbPool, group_id: &str, fingerprint: &str) -> Result<(), EngineError> {
    let group_id = group_id.to_string();
    let fingerprint = fingerprint.to_string();
    db_call(pool, move |conn| {
        conn.execute(
            "DELETE FROM group_members WHERE group_id = ?1 AND fingerprint = ?2",
            rusqlite::params![group_id, fingerprint],
        )?;
        Ok(())
    })
    .await
}

async fn member_rows(pool: &DbPool, group_id: &str) -> Result<Vec<GroupMemberInput>, EngineError> {
    let group_id = group_id.to_string();
    db_call(pool, move |conn| {
        let mut stmt = conn.prepare("SELECT fingerprint, verifying_key, kem_public FROM group_members WHERE group_id = ?1")?;
        let rows = stmt.query_map([group_id], |row| {
            Ok(GroupMemberInput {
                fingerprint: row.get::<_, String>(0)?,
                verifying_key: row.get::<_, Vec<u8>>(1)?,
                kem_public: row.get::<_, Vec<u8>>(2)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
    })
    .await
}

/// A group invite's inviter must already be a known direct contact -- invites
/// ride the same inbox slot contact requests do, so by the time one arrives
/// the sender has necessarily already gone through that handshake.
async fn contact_verifying_key(pool: &DbPool, fingerprint: &str) -> Option<Vec<u8>> {
    let fingerprint = fingerprint.to_string();
    db_call(pool, move |conn| conn.query_row("SELECT verifying_key FROM contacts WHERE fingerprint = ?1", [fingerprint], |row| row.get::<_, Vec<u8>>(0)))
        .await
        .ok()
}

async fn member_verifying_key(pool: &DbPool, group_id: &str, fingerprint: &str) -> Option<Vec<u8>> {
    let group_id = group_id.to_string();
    let fingerprint = fingerprint.to_string();
    db_call(pool, move |conn| {
        conn.query_row(
            "SELECT verifying_key FROM group_members WHERE group_id = ?1 AND fingerprint = ?2",
            rusqlite::params![group_id, fingerprint],
            |row| row.get::<_, Vec<u8>>(0),
        )
    })
    .await
    .ok()
}

async fn insert_group_message(
    pool: &DbPool,
    id: &str,
    group_id: &str,
    sender_fp: Option<&str>,
    direction: &str,
    plaintext: &str,
    created_at: i64,
) -> Result<(), EngineError> {
    let id = id.to_string();
    let group_id = group_id.to_string();
    let sender_fp = sender_fp.map(str::to_string);
    let direction = direction.to_string();
    let plaintext = plaintext.to_string();
    db_call(pool, move |conn| {
        conn.execute(
            "INSERT OR IGNORE INTO messages (id, contact_fp, group_id, sender_fp, direction, plaintext, status, created_at, retry_count, message_type) \
             VALUES (?1, NULL, ?2, ?3, ?4, ?5, ?6, ?7, 0, 'text')",
            rusqlite::params![id, group_id, sender_fp, direction, plaintext, crate::delivery::STATUS_SENT, created_at],
        )?;
        Ok(())
    })
    .await
}

/// Deposit a group-invite envelope for each `invitees` member, carrying the
/// full `roster` so invitees can verify/seal to every other member without
/// first adding them as direct contacts.
async fn invite_members(
    ctx: &Arc<EngineContext>,
    identity: &Identity,
    group_id: &str,
    group_name: &str,
    gek: &[u8; 32],
    invitees: &[GroupMemberInput],
    roster: &[GroupRosterEntry],
) {
    for member in invitees {
        let Ok(member_kem) = Identity::kem_public_from_bytes(&member.kem_public) else { continue };
        let Ok(env) = envelope::build_group_invite(identity, timestamp_now(), group_id, group_name, gek, &member_kem, roster.to_vec()) else {
            continue;
        };
        let Ok(wire) = serde_json::to_vec(&env) else { continue };
        let key = record_key_for(&contact_request_inbox_keypair(&member.fingerprint));
        let _ = ctx.facade.put(&key, wire).await;
    }
}

fn roster_of(my_fp: &str, identity: &Identity, members: &[GroupMemberInput]) -> Vec<GroupRosterEntry> {
    let mut roster = vec![GroupRosterEntry {
        fingerprint: my_fp.to_string(),
        verifying_key: identity.export_verifying_key(),
        kem_public: identity.export_kem_public(),
    }];
    roster.extend(members.iter().map(|m| GroupRosterEntry {
        fingerprint: m.fingerprint.clone(),
        verifying_key: m.verifying_key.clone(),
        kem_public: m.kem_public.clone(),
    }));
    roster
}

/// Create a group: generate a fresh GEK, file the creator and every member
/// locally, and invite each member (spec §4.6).
pub async fn create_group(ctx: &Arc<EngineContext>, name: &str, members: Vec<GroupMemberInput>) -> Result<String, EngineError> {
    let identity = ctx.identity()?;
    let my_fp = ctx.fingerprint()?;
    let group_id = uuid::Uuid::new_v4().to_string();
    let gek = fresh_gek();

    ctx.keystore.save_gek(&group_id, &gek, ctx.password().as_deref())?;
    insert_group(&ctx.pool, &group_id, name, &my_fp, timestamp_now() / 1000).await?;
    insert_member(
        &ctx.pool,
        &group_id,
        &GroupMemberInput { fingerprint: my_fp.clone(), verifying_key: identity.export_verifying_key(), kem_public: identity.export_kem_public() },
    )
    .await?;
    for member in &members {
        insert_member(&ctx.pool, &group_id, member).await?;
    }

    let roster = roster_of(&my_fp, &identity, &members);
    invite_members(ctx, &identity, &group_id, name, &gek, &members, &roster).await;

    ctx.events.dispatch(Event::GroupUpdated { group_id: group_id.clone() });
    Ok(group_id)
}

/// Best-effort pull of a group topic's latest message into the local cache.
/// Non-fatal: a read or decode failure just leaves the cache as it was.
async fn sync_group(ctx: &Arc<EngineContext>, group_id: &str) -> Result<(), EngineError> {
    let Some(gek) = load_gek(ctx, group_id)? else { return Ok(()) };
    let key = record_key_for(&group_topic_keypair(group_id));
    let Ok(Some(raw)) = ctx.facade.get(&key).await else { return Ok(()) };
    let Ok(envelope) = engine_protocol::messaging::receiver::parse_envelope(&raw) else { return Ok(()) };
    if envelope.kind != EnvelopeKind::GroupMessage {
        return Ok(());
    }

    let my_fp = ctx.fingerprint().unwrap_or_default();
    if envelope.sender_fp == my_fp {
        return Ok(()); // our own outgoing message, already recorded locally
    }

    let Some(sender_verifying_key) = member_verifying_key(&ctx.pool, group_id, &envelope.sender_fp).await else { return Ok(()) };
    if envelope::verify(&envelope, &sender_verifying_key).is_err() {
        return Ok(());
    }

    let Ok(MessagePayload::GroupMessage { body, group_id: payload_group_id }) = envelope::open_group(&gek, &envelope) else {
        return Ok(());
    };
    if payload_group_id != group_id {
        return Ok(());
    }

    let id = format!("{group_id}:{}:{}", envelope.sender_fp, envelope.timestamp_ms);
    insert_group_message(&ctx.pool, &id, group_id, Some(&envelope.sender_fp), "incoming", &body, (envelope.timestamp_ms / 1000) as i64).await?;
    ctx.events.dispatch(Event::GroupUpdated { group_id: group_id.to_string() });
    Ok(())
}

/// List every group this identity belongs to, syncing each one's topic
/// record into the local message cache first (best-effort).
pub async fn get_groups(ctx: &Arc<EngineContext>) -> Result<Vec<GroupView>, EngineError> {
    let rows = db_call(&ctx.pool, |conn| {
        let mut stmt = conn.prepare("SELECT id, name, creator_fp, created_at FROM groups")?;
        let rows = stmt.query_map([], |row| {
            Ok(GroupView { id: get_str(row, "id"), name: get_str(row, "name"), creator_fp: get_str(row, "creator_fp"), created_at: get_i64(row, "created_at") })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
    })
    .await?;

    for group in &rows {
        let _ = sync_group(ctx, &group.id).await;
    }
    Ok(rows)
}

pub async fn get_group_info(ctx: &Arc<EngineContext>, group_id: &str) -> Result<GroupView, EngineError> {
    let _ = sync_group(ctx, group_id).await;
    let id = group_id.to_string();
    db_call(&ctx.pool, move |conn| {
        conn.query_row("SELECT id, name, creator_fp, created_at FROM groups WHERE id = ?1", [id], |row| {
            Ok(GroupView { id: get_str(row, "id"), name: get_str(row, "name"), creator_fp: get_str(row, "creator_fp"), created_at: get_i64(row, "created_at") })
        })
    })
    .await
    .map_err(|_| EngineError::NotFound(format!("group {group_id}")))
}

pub async fn get_group_members(ctx: &Arc<EngineContext>, group_id: &str) -> Result<Vec<String>, EngineError> {
    let _ = sync_group(ctx, group_id).await;
    let id = group_id.to_string();
    db_call(&ctx.pool, move |conn| {
        let mut stmt = conn.prepare("SELECT fingerprint FROM group_members WHERE group_id = ?1")?;
        let rows = stmt.query_map([id], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>()
    })
    .await
}

/// Seal and deposit a message on the group's topic record, signed by us and
/// symmetrically sealed under the group's current GEK (spec §4.6).
pub async fn send_group_message(ctx: &Arc<EngineContext>, group_id: &str, body: &str) -> Result<String, EngineError> {
    let identity = ctx.identity()?;
    let gek = load_gek(ctx, group_id)?.ok_or_else(|| EngineError::NotFound(format!("group {group_id}")))?;

    let envelope = envelope::build_group_message(&identity, timestamp_now(), group_id, &gek, body)?;
    let wire = serde_json::to_vec(&envelope).map_err(|e| EngineError::Internal(e.to_string()))?;
    let key = record_key_for(&group_topic_keypair(group_id));
    ctx.facade.put(&key, wire).await?;

    let id = uuid::Uuid::new_v4().to_string();
    insert_group_message(&ctx.pool, &id, group_id, None, "outgoing", body, timestamp_now() / 1000).await?;
    ctx.events.dispatch(Event::MessageSent { message_id: id.clone(), new_status: crate::delivery::STATUS_SENT });
    Ok(id)
}

/// Page through a group's messages, oldest first -- unlike `messaging::get_conversation`,
/// which pages direct messages newest-first (spec §4.6).
pub async fn get_group_conversation(ctx: &Arc<EngineContext>, group_id: &str, after: i64, limit: u32) -> Result<Vec<GroupMessageRecord>, EngineError> {
    let _ = sync_group(ctx, group_id).await;
    let id = group_id.to_string();
    db_call(&ctx.pool, move |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, group_id, sender_fp, direction, plaintext, created_at \
             FROM messages WHERE group_id = ?1 AND created_at > ?2 ORDER BY created_at ASC LIMIT ?3",
        )?;
        let rows = stmt.query_map(rusqlite::params![id, after, limit], |row| {
            Ok(GroupMessageRecord {
                id: get_str(row, "id"),
                group_id: get_str(row, "group_id"),
                sender_fp: get_str_opt(row, "sender_fp"),
                direction: get_str(row, "direction"),
                plaintext: get_str(row, "plaintext"),
                created_at: get_i64(row, "created_at"),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
    })
    .await
}

/// Add a member and invite them with the group's current (unrotated) GEK.
/// Anyone already in the group may add a new member (spec §4.6); only
/// removal is creator-restricted.
pub async fn add_group_member(ctx: &Arc<EngineContext>, group_id: &str, member: GroupMemberInput) -> Result<(), EngineError> {
    let identity = ctx.identity()?;
    let my_fp = ctx.fingerprint()?;
    let gek = load_gek(ctx, group_id)?.ok_or_else(|| EngineError::NotFound(format!("group {group_id}")))?;
    let group_name = get_group_info(ctx, group_id).await?.name;

    insert_member(&ctx.pool, group_id, &member).await?;

    let existing = member_rows(&ctx.pool, group_id).await?;
    let roster = roster_of(&my_fp, &identity, &existing);
    invite_members(ctx, &identity, group_id, &group_name, &gek, std::slice::from_ref(&member), &roster).await;

    ctx.events.dispatch(Event::GroupUpdated { group_id: group_id.to_string() });
    Ok(())
}

/// Remove a member (creator-only) and rotate the GEK, re-inviting every
/// remaining member with the new key (spec §4.6: a removed member must not
/// be able to decrypt messages sent after their removal).
pub async fn remove_group_member(ctx: &Arc<EngineContext>, group_id: &str, fingerprint: &str) -> Result<(), EngineError> {
    let my_fp = ctx.fingerprint()?;
    let info = get_group_info(ctx, group_id).await?;
    if info.creator_fp != my_fp {
        return Err(EngineError::Permission("only the group creator may remove members".into()));
    }

    delete_member(&ctx.pool, group_id, fingerprint).await?;

    let identity = ctx.identity()?;
    let new_gek = fresh_gek();
    ctx.keystore.save_gek(group_id, &new_gek, ctx.password().as_deref())?;

    let remaining = member_rows(&ctx.pool, group_id).await?;
    let roster = roster_of(&my_fp, &identity, &remaining);
    invite_members(ctx, &identity, group_id, &info.name, &new_gek, &remaining, &roster).await;

    ctx.events.dispatch(Event::GroupUpdated { group_id: group_id.to_string() });
    Ok(())
}

/// Accept a group-invite envelope delivered to our contact-request inbox:
/// verify it against the inviter's known key, unwrap the GEK, and file the
/// group and its roster locally (spec §4.6).
pub async fn accept_group_invite(ctx: &Arc<EngineContext>, raw: &[u8]) -> Result<String, EngineError> {
    let identity = ctx.identity()?;
    let envelope = engine_protocol::messaging::receiver::parse_envelope(raw)?;
    if envelope.kind != EnvelopeKind::GroupInvite {
        return Err(EngineError::InvalidParam("expected a group-invite envelope".into()));
    }

    let inviter_fp = envelope.sender_fp.clone();
    let inviter_key = contact_verifying_key(&ctx.pool, &inviter_fp).await.ok_or(EngineError::KeyUnavailable)?;
    envelope::verify(&envelope, &inviter_key)?;

    let payload = envelope::open(&identity, &envelope)?;
    let MessagePayload::GroupInvite { group_id, group_name, wrapped_gek, members } = payload else {
        return Err(EngineError::Internal("expected a group-invite payload".into()));
    };

    let gek = engine_crypto::message::unwrap_group_key(&identity, &wrapped_gek)?;
    ctx.keystore.save_gek(&group_id, &gek, ctx.password().as_deref())?;

    insert_group(&ctx.pool, &group_id, &group_name, &inviter_fp, timestamp_now() / 1000).await?;
    for entry in members {
        insert_member(
            &ctx.pool,
            &group_id,
            &GroupMemberInput { fingerprint: entry.fingerprint, verifying_key: entry.verifying_key, kem_public: entry.kem_public },
        )
        .await?;
    }

    ctx.events.dispatch(Event::GroupUpdated { group_id: group_id.clone() });
    Ok(group_id)
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

    fn member_of(identity: &Identity) -> GroupMemberInput {
        GroupMemberInput { fingerprint: identity.fingerprint(), verifying_key: identity.export_verifying_key(), kem_public: identity.export_kem_public() }
    }

    #[tokio::test]
    async fn create_group_files_roster_and_invites_members() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        let alice = Identity::generate();
        load_session(&ctx, &dir, alice);

        let bob = Identity::generate();
        let group_id = create_group(&ctx, "friends", vec![member_of(&bob)]).await.unwrap();

        let members = get_group_members(&ctx, &group_id).await.unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.contains(&bob.fingerprint()));

        let key = record_key_for(&contact_request_inbox_keypair(&bob.fingerprint()));
        let wire = ctx.facade.get(&key).await.unwrap().unwrap();
        let envelope: engine_protocol::messaging::MessageEnvelope = serde_json::from_slice(&wire).unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::GroupInvite);
    }

    #[tokio::test]
    async fn bob_accepts_invite_and_reads_alices_message() {
        let dir_a = TempDir::new().unwrap();
        let ctx_a = test_ctx(&dir_a);
        let alice = Identity::generate();
        load_session(&ctx_a, &dir_a, alice.clone());

        let bob = Identity::generate();
        let group_id = create_group(&ctx_a, "friends", vec![member_of(&bob)]).await.unwrap();
        send_group_message(&ctx_a, &group_id, "hello group").await.unwrap();

        let dir_b = TempDir::new().unwrap();
        let ctx_b = test_ctx(&dir_b);
        load_session(&ctx_b, &dir_b, bob.clone());
        // Bob needs Alice on file as a contact to verify her invite signature.
        add_contact(&ctx_b, &alice.fingerprint(), &alice.export_verifying_key(), &alice.export_kem_public(), None).await.unwrap();
        // Share the same in-memory DHT between the two contexts for this test.
        let key = record_key_for(&contact_request_inbox_keypair(&bob.fingerprint()));
        let wire = ctx_a.facade.get(&key).await.unwrap().unwrap();
        ctx_b.facade.put(&key, wire.clone()).await.unwrap();

        let accepted_group_id = accept_group_invite(&ctx_b, &wire).await.unwrap();
        assert_eq!(accepted_group_id, group_id);

        let topic_key = record_key_for(&group_topic_keypair(&group_id));
        let topic_value = ctx_a.facade.get(&topic_key).await.unwrap().unwrap();
        ctx_b.facade.put(&topic_key, topic_value).await.unwrap();

        let conversation = get_group_conversation(&ctx_b, &group_id, 0, 10).await.unwrap();
        assert_eq!(conversation.len(), 1);
        assert_eq!(conversation[0].plaintext, "hello group");
    }

    #[tokio::test]
    async fn remove_member_rotates_gek_and_reinvites_remaining() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        let alice = Identity::generate();
        load_session(&ctx, &dir, alice);

        let bob = Identity::generate();
        let carol = Identity::generate();
        let group_id = create_group(&ctx, "friends", vec![member_of(&bob), member_of(&carol)]).await.unwrap();

        let gek_before = load_gek(&ctx, &group_id).unwrap().unwrap();
        remove_group_member(&ctx, &group_id, &bob.fingerprint()).await.unwrap();
        let gek_after = load_gek(&ctx, &group_id).unwrap().unwrap();
        assert_ne!(gek_before, gek_after);

        let members = get_group_members(&ctx, &group_id).await.unwrap();
        assert!(!members.contains(&bob.fingerprint()));
        assert!(members.contains(&carol.fingerprint()));

        let key = record_key_for(&contact_request_inbox_keypair(&carol.fingerprint()));
        let wire = ctx.facade.get(&key).await.unwrap().unwrap();
        let envelope: engine_protocol::messaging::MessageEnvelope = serde_json::from_slice(&wire).unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::GroupInvite);
    }

    #[tokio::test]
    async fn non_creator_cannot_remove_member() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        let alice = Identity::generate();
        let bob = Identity::generate();
        load_session(&ctx, &dir, bob.clone());

        // File a group Bob belongs to but did not create.
        insert_group(&ctx.pool, "group-1", "friends", &alice.fingerprint(), 0).await.unwrap();
        insert_member(&ctx.pool, "group-1", &member_of(&alice)).await.unwrap();
        insert_member(&ctx.pool, "group-1", &member_of(&bob)).await.unwrap();

        let err = remove_group_member(&ctx, "group-1", &alice.fingerprint()).await.unwrap_err();
        assert!(matches!(err, EngineError::Permission(_)));
    }
}
