//! Profile handlers (spec §4.6 Profile & Backup).
//!
//! `profile_cache` rows are only ever written once both public keys are
//! known -- a signature-verified [`engine_protocol::ProfileRecord`] always
//! carries both, so there is no placeholder-row path here (see DESIGN.md).

use std::sync::Arc;

use engine_protocol::dht::keys::{name_registration_keypair, profile_keypair, record_key_for};
use engine_protocol::{build_profile_record, verify_profile_record, ProfileRecord};

use crate::context::EngineContext;
use crate::db::{get_i64, get_str, get_str_opt, timestamp_now, DbPool};
use crate::db_helpers::db_call;
use crate::error::EngineError;

pub struct ProfileView {
    pub fingerprint: String,
    pub registered_name: Option<String>,
    pub verifying_key: Vec<u8>,
    pub kem_public: Vec<u8>,
    pub last_synced_at: i64,
}

async fn cached_profile(pool: &DbPool, fingerprint: &str) -> Option<ProfileView> {
    let fp = fingerprint.to_string();
    db_call(pool, move |conn| {
        conn.query_row(
            "SELECT fingerprint, registered_name, verifying_key, kem_public, last_synced_at FROM profile_cache WHERE fingerprint = ?1",
            [fp],
            |row| {
                Ok(ProfileView {
                    fingerprint: get_str(row, "fingerprint"),
                    registered_name: get_str_opt(row, "registered_name"),
                    verifying_key: row.get::<_, Vec<u8>>("verifying_key")?,
                    kem_public: row.get::<_, Vec<u8>>("kem_public")?,
                    last_synced_at: get_i64(row, "last_synced_at"),
                })
            },
        )
    })
    .await
    .ok()
}

async fn upsert_cache(pool: &DbPool, record: &ProfileRecord) -> Result<(), EngineError> {
    let fingerprint = record.fingerprint.clone();
    let registered_name = record.registered_name.clone();
    let verifying_key = record.verifying_key.clone();
    let kem_public = record.kem_public.clone();
    let synced_at = timestamp_now() / 1000;
    db_call(pool, move |conn| {
        conn.execute(
            "INSERT OR REPLACE INTO profile_cache (fingerprint, registered_name, verifying_key, kem_public, last_synced_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![fingerprint, registered_name, verifying_key, kem_public, synced_at],
        )?;
        Ok(())
    })
    .await
}

/// Fetch `fingerprint`'s profile record off the DHT, verify it, and cache it.
/// On a signature-verification failure this takes the spec's corrective
/// action: republish our own profile if `fingerprint` is us, otherwise
/// auto-remove the contact (their identity key material no longer matches
/// what they signed with, a permanent error for this operation).
async fn sync_profile(ctx: &Arc<EngineContext>, fingerprint: &str) -> Result<(), EngineError> {
    let key = record_key_for(&profile_keypair(fingerprint));
    let Some(raw) = ctx.facade.get(&key).await? else { return Ok(()) };
    let Ok(record) = serde_json::from_slice::<ProfileRecord>(&raw) else { return Ok(()) };
    if record.fingerprint != fingerprint {
        return Ok(());
    }

    if verify_profile_record(&record).is_err() {
        let my_fp = ctx.fingerprint().unwrap_or_default();
        if fingerprint == my_fp {
            let current_name = cached_profile(&ctx.pool, fingerprint).await.and_then(|p| p.registered_name);
            let _ = republish_own_profile(ctx, current_name.as_deref()).await;
        } else {
            let _ = super::contacts::remove_contact(ctx, fingerprint).await;
        }
        return Err(EngineError::InvalidSignature);
    }

    upsert_cache(&ctx.pool, &record).await
}

/// Cache-first profile lookup (spec §4.6): serve the local cache, syncing it
/// against the DHT's current record first on a best-effort basis.
pub async fn get_profile(ctx: &Arc<EngineContext>, fingerprint: &str) -> Result<ProfileView, EngineError> {
    let _ = sync_profile(ctx, fingerprint).await;
    cached_profile(&ctx.pool, fingerprint).await.ok_or_else(|| EngineError::NotFound(format!("profile {fingerprint}")))
}

/// Resolve a registered name to its fingerprint via the DHT's name directory.
pub async fn lookup_name(ctx: &Arc<EngineContext>, name: &str) -> Result<Option<String>, EngineError> {
    let key = record_key_for(&name_registration_keypair(name));
    let Some(bytes) = ctx.facade.get(&key).await? else { return Ok(None) };
    String::from_utf8(bytes).map(Some).map_err(|e| EngineError::Internal(e.to_string()))
}

/// Publish an updated profile record and update the local cache directly --
/// no read-back, to avoid the DHT's propagation delay (spec §4.6).
pub async fn update_profile(ctx: &Arc<EngineContext>, registered_name: Option<&str>) -> Result<(), EngineError> {
    let identity = ctx.identity()?;
    let record = build_profile_record(&identity, registered_name, timestamp_now());
    let wire = serde_json::to_vec(&record).map_err(|e| EngineError::Internal(e.to_string()))?;
    let key = record_key_for(&profile_keypair(&record.fingerprint));
    ctx.facade.put(&key, wire).await?;
    upsert_cache(&ctx.pool, &record).await
}

async fn republish_own_profile(ctx: &Arc<EngineContext>, registered_name: Option<&str>) -> Result<(), EngineError> {
    update_profile(ctx, registered_name).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::db::create_pool;
    use crate::delivery::DeliveryEngine;
    use crate::events::EventDispatcher;
    use crate::handlers::contacts::{add_contact, list_contact_fingerprints};
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
    async fn update_then_get_profile_round_trips() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        let alice = Identity::generate();
        let alice_fp = alice.fingerprint();
        load_session(&ctx, &dir, alice);

        update_profile(&ctx, Some("alice")).await.unwrap();
        let profile = get_profile(&ctx, &alice_fp).await.unwrap();
        assert_eq!(profile.registered_name.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn tampered_contact_profile_is_removed() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        let alice = Identity::generate();
        load_session(&ctx, &dir, alice);

        let bob = Identity::generate();
        add_contact(&ctx, &bob.fingerprint(), &bob.export_verifying_key(), &bob.export_kem_public(), None).await.unwrap();

        let mut record = build_profile_record(&bob, Some("bob"), timestamp_now());
        record.registered_name = Some("mallory".to_string());
        let wire = serde_json::to_vec(&record).unwrap();
        let key = record_key_for(&profile_keypair(&bob.fingerprint()));
        ctx.facade.put(&key, wire).await.unwrap();

        let err = get_profile(&ctx, &bob.fingerprint()).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidSignature));
        assert!(list_contact_fingerprints(&ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lookup_name_resolves_registered_fingerprint() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        let key = record_key_for(&name_registration_keypair("alice"));
        ctx.facade.put(&key, b"deadbeef".to_vec()).await.unwrap();

        let resolved = lookup_name(&ctx, "alice").await.unwrap();
        assert_eq!(resolved.as_deref(), Some("deadbeef"));
    }
}
