//! Identity handlers (spec §4.6). Seed/mnemonic generation lives in
//! `engine_crypto::mnemonic` and is called by the binding layer before
//! `create_identity`; this module only turns already-derived material into
//! an on-disk, DHT-registered identity.

use std::sync::Arc;

use engine_crypto::Identity;

use crate::config::is_valid_identity_name;
use crate::context::{EngineContext, Session};
use crate::error::EngineError;
use crate::events::Event;
use crate::identity_lock::IdentityLock;

/// Generates the ML-DSA/ML-KEM keypair from `signing_seed`/`enc_seed`,
/// persists it (optionally encrypted under `password`), stores the mnemonic,
/// and registers `name -> fingerprint` on the DHT. `master_seed` is not
/// persisted separately — it is re-derivable from the mnemonic on demand via
/// [`engine_crypto::mnemonic::derive_seeds`] — but is accepted to keep this
/// signature matching the spec's `create_identity` contract.
pub async fn create_identity(
    ctx: &Arc<EngineContext>,
    name: &str,
    signing_seed: &[u8; 32],
    enc_seed: &[u8; 32],
    _master_seed: &[u8; 32],
    mnemonic: &str,
    password: Option<&str>,
) -> Result<String, EngineError> {
    if !is_valid_identity_name(name) {
        return Err(EngineError::InvalidParam(format!("identity name {name:?} must match [a-z0-9_-]+")));
    }

    let identity = Identity::from_seeds(signing_seed, enc_seed);
    let fingerprint = identity.fingerprint();

    if let Err(e) = ctx
        .keystore
        .save_identity(&identity.export_dsa_secret(), &identity.export_kem_secret(), password)
    {
        cleanup_artefacts(ctx);
        return Err(e);
    }
    if let Err(e) = ctx.keystore.save_mnemonic(mnemonic, password) {
        cleanup_artefacts(ctx);
        return Err(e);
    }

    let owner_keypair = engine_protocol::dht::keys::name_registration_keypair(name);
    let key = engine_protocol::dht::keys::record_key_for(&owner_keypair);
    if let Err(e) = ctx.facade.put(&key, fingerprint.clone().into_bytes()).await {
        cleanup_artefacts(ctx);
        return Err(EngineError::from(e));
    }

    Ok(fingerprint)
}

fn cleanup_artefacts(ctx: &Arc<EngineContext>) {
    for err in ctx.keystore.delete_all(&ctx.config.data_dir) {
        tracing::warn!(error = %err, "cleanup after failed create_identity left an artefact behind");
    }
}

/// Acquires the process-wide identity lock, decrypts keys, sets engine state
/// `ACTIVE`, and — unless `minimal` — starts the contact-request listener and
/// every contact's outbox/presence/ACK listeners. The presence heartbeat and
/// stabilization task are started by the caller (`Engine::bootstrap`/`Engine`
/// methods), which own their lifetimes; this handler only covers the
/// identity-specific half of spec §4.6's `load_identity`.
pub async fn load_identity(ctx: &Arc<EngineContext>, password: Option<&str>, minimal: bool) -> Result<String, EngineError> {
    let lock = IdentityLock::acquire(&ctx.config.identity_lock_path())?;

    let (dsa, kem) = ctx.keystore.load_identity(password)?;
    let identity = Identity::from_exported(dsa, kem)?;
    let fingerprint = identity.fingerprint();

    ctx.set_session(Session {
        identity: Arc::new(identity),
        fingerprint: fingerprint.clone(),
        password: password.map(str::to_string),
        _lock: lock,
    });
    ctx.lifecycle.set_active();
    ctx.events.dispatch(Event::IdentityLoaded { fingerprint: fingerprint.clone() });

    if !minimal {
        ctx.listeners.clone().start_contact_request_listener(&fingerprint).await?;
        let contacts = super::contacts::list_contact_fingerprints(ctx).await?;
        ctx.listeners.clone().listen_all_contacts(&fingerprint, &contacts).await;
    }

    Ok(fingerprint)
}

/// Unloads the identity if it is the one currently loaded, then removes
/// every on-disk artefact regardless (this engine's `data_dir` holds exactly
/// one identity — see DESIGN.md Open Question on multi-identity data dirs).
pub fn delete_identity(ctx: &Arc<EngineContext>, fingerprint: &str) -> Vec<String> {
    if ctx.fingerprint().ok().as_deref() == Some(fingerprint) {
        ctx.clear_session();
    }
    ctx.keystore.delete_all(&ctx.config.data_dir)
}

pub fn change_password(ctx: &Arc<EngineContext>, old: Option<&str>, new: Option<&str>) -> Result<(), EngineError> {
    ctx.keystore.change_password(old, new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_pool;
    use crate::delivery::DeliveryEngine;
    use crate::events::EventDispatcher;
    use crate::keystore::KeyStore;
    use crate::lifecycle::LifecycleController;
    use crate::listener_manager::ListenerManager;
    use crate::registry::RequestRegistry;
    use crate::task_queue::TaskQueue;
    use crate::config::EngineConfig;
    use engine_crypto::mnemonic::{derive_seeds, generate_mnemonic};
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

    #[tokio::test]
    async fn create_then_load_round_trips_fingerprint() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        let mnemonic = generate_mnemonic().unwrap();
        let seeds = derive_seeds(&mnemonic, "");

        let fingerprint = create_identity(
            &ctx,
            "alice",
            &seeds.signing_seed,
            &seeds.enc_seed,
            &seeds.master_seed,
            &mnemonic.to_string(),
            None,
        )
        .await
        .unwrap();

        let loaded_fp = load_identity(&ctx, None, true).await.unwrap();
        assert_eq!(loaded_fp, fingerprint);
        assert!(ctx.has_session());
    }

    #[tokio::test]
    async fn invalid_name_is_rejected() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        let mnemonic = generate_mnemonic().unwrap();
        let seeds = derive_seeds(&mnemonic, "");
        let err = create_identity(
            &ctx,
            "Not Valid!",
            &seeds.signing_seed,
            &seeds.enc_seed,
            &seeds.master_seed,
            &mnemonic.to_string(),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidParam(_)));
    }

    #[tokio::test]
    async fn delete_identity_removes_artefacts_and_clears_session() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir);
        let mnemonic = generate_mnemonic().unwrap();
        let seeds = derive_seeds(&mnemonic, "");
        let fingerprint = create_identity(
            &ctx,
            "bob",
            &seeds.signing_seed,
            &seeds.enc_seed,
            &seeds.master_seed,
            &mnemonic.to_string(),
            None,
        )
        .await
        .unwrap();
        load_identity(&ctx, None, true).await.unwrap();

        let errors = delete_identity(&ctx, &fingerprint);
        assert!(errors.is_empty());
        assert!(!ctx.has_session());
        assert!(!ctx.config.keys_dir().exists());
    }
}
