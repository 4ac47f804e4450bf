//! Presence announce (spec §4.9, §6).
//!
//! A privacy-preserving, timestamp-only payload published under
//! `SHA3-512(fingerprint)`: the only claim it makes is "this fingerprint was
//! online at this timestamp". No status enum, no rich presence — those
//! belong to the profile record, which is outside this core's scope.

use crate::dht::keys::{presence_keypair, record_key_for};
use crate::dht::DHTManager;
use crate::error::ProtocolError;

const PRESENCE_SUBKEY_COUNT: u32 = 1;
const PRESENCE_SUBKEY_TIMESTAMP: u32 = 0;

/// Record key for `fingerprint`'s presence slot, without touching the network.
pub fn presence_record_key_for(fingerprint: &str) -> String {
    record_key_for(&presence_keypair(fingerprint))
}

/// Publish our own presence timestamp (milliseconds since epoch).
pub async fn publish(dht: &DHTManager, my_fp: &str, timestamp_ms: i64) -> Result<(), ProtocolError> {
    let owner = presence_keypair(my_fp);
    let key = record_key_for(&owner);
    if dht.create_record_with_owner(PRESENCE_SUBKEY_COUNT, owner.clone()).await.is_err() {
        // Record already exists from an earlier session — reopen writable.
        dht.open_record_writable(&key, owner).await?;
    }
    dht.set_value(&key, PRESENCE_SUBKEY_TIMESTAMP, timestamp_ms.to_be_bytes().to_vec())
        .await
}

/// Read a contact's last published presence timestamp, if any.
pub async fn read(dht: &DHTManager, contact_fp: &str) -> Result<Option<i64>, ProtocolError> {
    let key = presence_record_key_for(contact_fp);
    dht.open_record(&key).await?;
    let bytes = dht.get_value(&key, PRESENCE_SUBKEY_TIMESTAMP).await?;
    Ok(bytes.and_then(|b| b.try_into().ok()).map(i64::from_be_bytes))
}

/// Start watching a contact's presence slot.
pub async fn watch(dht: &DHTManager, contact_fp: &str) -> Result<bool, ProtocolError> {
    let key = presence_record_key_for(contact_fp);
    dht.open_record(&key).await?;
    dht.watch_record(&key, &[PRESENCE_SUBKEY_TIMESTAMP]).await
}

/// TTL window (§3): a contact is considered online if their last presence
/// timestamp is within this many seconds of now.
pub const ONLINE_TTL_SECS: i64 = 300;
