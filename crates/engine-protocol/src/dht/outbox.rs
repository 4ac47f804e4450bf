//! Per-contact DM outbox (spec §6, §4.7 day-bucket rotation).
//!
//! A sender deposits ciphertext for one specific recipient under
//! `contact_fp:outbox:my_fp:DAY_BUCKET`; the recipient listens on that key.
//! Because the key embeds the current UTC day, both ends must roll the key
//! (and the subscription) at midnight.

use crate::dht::keys::{dm_outbox_keypair, record_key_for};
use crate::dht::DHTManager;
use crate::error::ProtocolError;

/// Single-subkey schema: subkey 0 carries the latest ciphertext blob.
const OUTBOX_SUBKEY_COUNT: u32 = 1;
const OUTBOX_SUBKEY_DATA: u32 = 0;

/// Open (creating if necessary) our outbox to `recipient_fp` for `day_bucket`
/// and deposit `ciphertext` into it.
pub async fn deposit(
    dht: &DHTManager,
    my_fp: &str,
    recipient_fp: &str,
    day_bucket: u32,
    ciphertext: Vec<u8>,
) -> Result<String, ProtocolError> {
    let owner = dm_outbox_keypair(my_fp, recipient_fp, day_bucket);
    let key = dht.create_record_with_owner(OUTBOX_SUBKEY_COUNT, owner.clone()).await?;
    dht.open_record_writable(&key, owner).await?;
    dht.set_value(&key, OUTBOX_SUBKEY_DATA, ciphertext).await?;
    Ok(key)
}

/// Compute (without touching the network) the record key of our outbox to
/// `recipient_fp` for `day_bucket`, so the listener manager can watch it
/// before anything has ever been deposited.
pub fn outbox_record_key_for(my_fp: &str, recipient_fp: &str, day_bucket: u32) -> String {
    record_key_for(&dm_outbox_keypair(my_fp, recipient_fp, day_bucket))
}

/// Read the current ciphertext out of a contact's outbox to us.
pub async fn read(dht: &DHTManager, contact_fp: &str, my_fp: &str, day_bucket: u32) -> Result<Option<Vec<u8>>, ProtocolError> {
    let owner = dm_outbox_keypair(contact_fp, my_fp, day_bucket);
    let key = record_key_for(&owner);
    dht.open_record(&key).await?;
    dht.get_value(&key, OUTBOX_SUBKEY_DATA).await
}

/// Start watching a contact's outbox to us for the given day bucket.
/// Returns `true` if the watch is active.
pub async fn watch(dht: &DHTManager, contact_fp: &str, my_fp: &str, day_bucket: u32) -> Result<bool, ProtocolError> {
    let owner = dm_outbox_keypair(contact_fp, my_fp, day_bucket);
    let key = record_key_for(&owner);
    dht.open_record(&key).await?;
    dht.watch_record(&key, &[OUTBOX_SUBKEY_DATA]).await
}
