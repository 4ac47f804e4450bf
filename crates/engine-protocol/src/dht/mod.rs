pub mod keys;
pub mod outbox;
pub mod presence;

use std::collections::HashSet;

use veilid_core::{DHTSchema, RoutingContext, ValueSubkeyRangeSet, CRYPTO_KIND_VLD0};

use crate::error::ProtocolError;

/// Thin wrapper around a Veilid `RoutingContext` performing record CRUD,
/// watch, and get/set operations on the distributed hash table.
///
/// This is the only piece of the crate that talks to `veilid_core` DHT
/// primitives directly; everything above it (the facade, the listener
/// manager, the handlers) goes through here.
pub struct DHTManager {
    routing_context: RoutingContext,
    /// All record keys opened/created in this session, for bulk close on shutdown.
    pub open_records: HashSet<String>,
}

impl DHTManager {
    pub fn new(routing_context: RoutingContext) -> Self {
        Self {
            routing_context,
            open_records: HashSet::new(),
        }
    }

    /// Create a new DHT record with DFLT schema (single owner), letting Veilid
    /// mint a random owner keypair.
    ///
    /// Returns `(record_key, owner_keypair)`. The `owner_keypair` must be
    /// persisted and passed back to [`open_record_writable`] on subsequent
    /// sessions to retain write access.
    pub async fn create_record(
        &self,
        subkey_count: u32,
    ) -> Result<(String, Option<veilid_core::KeyPair>), ProtocolError> {
        let count = u16::try_from(subkey_count)
            .map_err(|_| ProtocolError::DhtError(format!("subkey_count {subkey_count} exceeds u16::MAX")))?;
        let schema = DHTSchema::dflt(count)
            .map_err(|e| ProtocolError::DhtError(format!("invalid schema: {e}")))?;

        let descriptor = self
            .routing_context
            .create_dht_record(CRYPTO_KIND_VLD0, schema, None)
            .await
            .map_err(|e| ProtocolError::DhtError(format!("create_dht_record: {e}")))?;

        let key_string = descriptor.key().to_string();
        let owner_keypair = descriptor
            .owner_secret()
            .map(|secret| veilid_core::KeyPair::new_from_parts(descriptor.owner().clone(), secret.value()));

        tracing::debug!(key = %key_string, has_keypair = owner_keypair.is_some(), "created DHT record");
        Ok((key_string, owner_keypair))
    }

    /// Create a new DHT record using a specific, caller-supplied owner keypair.
    ///
    /// Unlike [`create_record`], this makes the record key deterministic for
    /// that keypair — the mechanism the engine relies on to derive
    /// well-known record keys (contact-request inboxes, outboxes, presence)
    /// from [`keys::deterministic_keypair`].
    pub async fn create_record_with_owner(
        &self,
        subkey_count: u32,
        owner: veilid_core::KeyPair,
    ) -> Result<String, ProtocolError> {
        let count = u16::try_from(subkey_count)
            .map_err(|_| ProtocolError::DhtError(format!("subkey_count {subkey_count} exceeds u16::MAX")))?;
        let schema = DHTSchema::dflt(count)
            .map_err(|e| ProtocolError::DhtError(format!("invalid schema: {e}")))?;

        let descriptor = self
            .routing_context
            .create_dht_record(CRYPTO_KIND_VLD0, schema, Some(owner))
            .await
            .map_err(|e| ProtocolError::DhtError(format!("create_dht_record_with_owner: {e}")))?;

        let key_string = descriptor.key().to_string();
        tracing::debug!(key = %key_string, "created DHT record with deterministic owner");
        Ok(key_string)
    }

    /// Open an existing DHT record for **reading only** (no writer set).
    pub async fn open_record(&self, key: &str) -> Result<(), ProtocolError> {
        let record_key = key
            .parse()
            .map_err(|e| ProtocolError::DhtError(format!("invalid record key '{key}': {e}")))?;

        self.routing_context
            .open_dht_record(record_key, None)
            .await
            .map_err(|e| ProtocolError::DhtError(format!("open_dht_record: {e}")))?;

        tracing::debug!(key, "opened DHT record (read-only)");
        Ok(())
    }

    /// Open an existing DHT record **with write access** by providing the
    /// owner keypair it was created with.
    pub async fn open_record_writable(
        &self,
        key: &str,
        writer: veilid_core::KeyPair,
    ) -> Result<(), ProtocolError> {
        let record_key = key
            .parse()
            .map_err(|e| ProtocolError::DhtError(format!("invalid record key '{key}': {e}")))?;

        self.routing_context
            .open_dht_record(record_key, Some(writer))
            .await
            .map_err(|e| ProtocolError::DhtError(format!("open_dht_record (writable): {e}")))?;

        tracing::debug!(key, "opened DHT record (writable)");
        Ok(())
    }

    /// Close a DHT record, releasing local resources for it.
    pub async fn close_record(&self, key: &str) -> Result<(), ProtocolError> {
        let record_key = key
            .parse()
            .map_err(|e| ProtocolError::DhtError(format!("invalid record key '{key}': {e}")))?;

        self.routing_context
            .close_dht_record(record_key)
            .await
            .map_err(|e| ProtocolError::DhtError(format!("close_dht_record: {e}")))?;

        tracing::debug!(key, "closed DHT record");
        Ok(())
    }

    /// Get a subkey value from a DHT record. `None` if unset.
    pub async fn get_value(&self, key: &str, subkey: u32) -> Result<Option<Vec<u8>>, ProtocolError> {
        let record_key = key
            .parse()
            .map_err(|e| ProtocolError::DhtError(format!("invalid record key '{key}': {e}")))?;

        let value = self
            .routing_context
            .get_dht_value(record_key, subkey, false)
            .await
            .map_err(|e| ProtocolError::DhtError(format!("get_dht_value: {e}")))?;

        Ok(value.map(|v| v.data().to_vec()))
    }

    /// Set a subkey value on a DHT record we own.
    pub async fn set_value(&self, key: &str, subkey: u32, value: Vec<u8>) -> Result<(), ProtocolError> {
        let record_key = key
            .parse()
            .map_err(|e| ProtocolError::DhtError(format!("invalid record key '{key}': {e}")))?;

        self.routing_context
            .set_dht_value(record_key, subkey, value, None)
            .await
            .map_err(|e| ProtocolError::DhtError(format!("set_dht_value: {e}")))?;

        Ok(())
    }

    /// Watch specific subkeys on a DHT record for changes.
    ///
    /// Returns `true` if the watch is active, `false` if Veilid refused it
    /// (the caller must then fall back to polling — see `unwatched` handling
    /// in the listener manager).
    pub async fn watch_record(&self, key: &str, subkeys: &[u32]) -> Result<bool, ProtocolError> {
        let record_key = key
            .parse()
            .map_err(|e| ProtocolError::DhtError(format!("invalid record key '{key}': {e}")))?;

        let subkey_range: ValueSubkeyRangeSet = subkeys.iter().copied().collect();

        let active = self
            .routing_context
            .watch_dht_values(record_key, Some(subkey_range), None, None)
            .await
            .map_err(|e| ProtocolError::DhtError(format!("watch_dht_values: {e}")))?;

        tracing::debug!(key, ?subkeys, active, "watching DHT record");
        Ok(active)
    }

    /// Cancel a watch on a record by passing an empty subkey range.
    pub async fn cancel_watch(&self, key: &str) -> Result<(), ProtocolError> {
        let record_key = key
            .parse()
            .map_err(|e| ProtocolError::DhtError(format!("invalid record key '{key}': {e}")))?;

        self.routing_context
            .cancel_dht_watch(record_key, None)
            .await
            .map_err(|e| ProtocolError::DhtError(format!("cancel_dht_watch: {e}")))?;

        tracing::debug!(key, "cancelled DHT watch");
        Ok(())
    }
}
