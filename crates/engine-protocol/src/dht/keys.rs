//! DHT key conventions consumed by the core (see spec §6).
//!
//! Veilid addresses a DHT record by `(crypto_kind, owner_public_key)`, not by
//! an arbitrary hash preimage. To honor the hash-keyed conventions below —
//! `SHA3-512(fingerprint ":requests")` and friends — the engine derives a
//! deterministic owner keypair from each hash and uses
//! [`DHTManager::create_record_with_owner`](super::DHTManager::create_record_with_owner)
//! / `open_record_writable` with it. Two peers who compute the same hash
//! arrive at the same keypair, and therefore the same record key, without
//! ever talking to each other first. This mirrors the pattern the DM mailbox
//! already used (owner keypair ⇒ deterministic record key); see DESIGN.md.

use ed25519_dalek::SigningKey;
use sha3::{Digest, Sha3_512};

/// Derive a Veilid owner keypair deterministically from arbitrary seed bytes.
///
/// Takes the first 32 bytes of `SHA3-512(domain_separator || seed)` as an
/// Ed25519 seed. Two calls with the same inputs always produce the same
/// keypair, which is exactly what every key convention below needs.
pub fn deterministic_keypair(domain: &str, seed: &[u8]) -> veilid_core::KeyPair {
    let signing_key = SigningKey::from_bytes(&deterministic_seed(domain, seed));
    let public = veilid_core::PublicKey::new(signing_key.verifying_key().to_bytes());
    let secret = veilid_core::SecretKey::new(signing_key.to_bytes());
    veilid_core::KeyPair::new_from_parts(public, secret)
}

/// Compute the DHT record key string that [`super::DHTManager::create_record_with_owner`]
/// would mint for this keypair, without touching the network. Veilid derives
/// a record's key deterministically from `(crypto_kind, owner_public_key)`.
pub fn record_key_for(owner: &veilid_core::KeyPair) -> String {
    veilid_core::RecordKey::new(veilid_core::CRYPTO_KIND_VLD0, owner.key().clone()).to_string()
}

/// The raw 32-byte Ed25519 seed underlying [`deterministic_keypair`], split
/// out so it can be unit-tested without depending on `veilid_core`'s key
/// types implementing equality.
fn deterministic_seed(domain: &str, seed: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3_512::new();
    hasher.update(domain.as_bytes());
    hasher.update(seed);
    let digest = hasher.finalize();

    let mut seed32 = [0u8; 32];
    seed32.copy_from_slice(&digest[..32]);
    seed32
}

/// Contact-request inbox: `SHA3-512(fingerprint ":requests")`.
pub fn contact_request_inbox_keypair(fingerprint: &str) -> veilid_core::KeyPair {
    deterministic_keypair("engine:requests", format!("{fingerprint}:requests").as_bytes())
}

/// Presence slot: `SHA3-512(fingerprint)`.
pub fn presence_keypair(fingerprint: &str) -> veilid_core::KeyPair {
    deterministic_keypair("engine:presence", fingerprint.as_bytes())
}

/// Per-contact DM outbox: `contact_fp:outbox:my_fp:DAY_BUCKET`.
///
/// `owner_fp` deposits ciphertext here for `recipient_fp` to read; `owner_fp`
/// must own the record so the day-bucket rotation can keep writing to it.
pub fn dm_outbox_keypair(owner_fp: &str, recipient_fp: &str, day_bucket: u32) -> veilid_core::KeyPair {
    let seed = format!("{recipient_fp}:outbox:{owner_fp}:{day_bucket}");
    deterministic_keypair("engine:outbox", seed.as_bytes())
}

/// ACK cursor slot: one per (sender, recipient) ordered pair, owned by the
/// recipient (the party publishing the acknowledgement).
pub fn ack_keypair(ack_owner_fp: &str, counterparty_fp: &str) -> veilid_core::KeyPair {
    let seed = format!("{ack_owner_fp}:ack:{counterparty_fp}");
    deterministic_keypair("engine:ack", seed.as_bytes())
}

/// Group topic slot for a given group UUID.
pub fn group_topic_keypair(group_id: &str) -> veilid_core::KeyPair {
    deterministic_keypair("engine:group", group_id.as_bytes())
}

/// Profile record slot: `SHA3-512(fingerprint ":profile")`, distinct from the
/// presence slot (`SHA3-512(fingerprint)`) so a profile update never races a
/// heartbeat publish over the same record.
pub fn profile_keypair(fingerprint: &str) -> veilid_core::KeyPair {
    deterministic_keypair("engine:profile", format!("{fingerprint}:profile").as_bytes())
}

/// Addressbook slot: one per owner, carrying their serialized contact list.
pub fn addressbook_keypair(owner_fp: &str) -> veilid_core::KeyPair {
    deterministic_keypair("engine:addressbook", format!("{owner_fp}:addressbook").as_bytes())
}

/// Message backup slot: one per owner, carrying a ciphertext only they can open.
pub fn message_backup_keypair(owner_fp: &str) -> veilid_core::KeyPair {
    deterministic_keypair("engine:backup", format!("{owner_fp}:backup").as_bytes())
}

/// Name registration directory entry: `SHA3-512("name:" || name)`.
pub fn name_registration_keypair(name: &str) -> veilid_core::KeyPair {
    deterministic_keypair("engine:name", name.as_bytes())
}

/// Version record: `SHA3-512("dna:system:version")`, fixed value-id 1.
pub fn version_record_keypair() -> veilid_core::KeyPair {
    deterministic_keypair("engine:version", b"dna:system:version")
}

/// UTC day bucket used by DM outbox keys and day-rotation checks.
pub fn current_day_bucket() -> u32 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    u32::try_from(now.as_secs() / 86_400).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_across_calls() {
        let a = deterministic_seed("engine:requests", b"abc123:requests");
        let b = deterministic_seed("engine:requests", b"abc123:requests");
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_domains_diverge() {
        let inbox = deterministic_seed("engine:requests", b"abc123");
        let presence = deterministic_seed("engine:presence", b"abc123");
        assert_ne!(inbox, presence);
    }

    #[test]
    fn outbox_rotates_with_day_bucket() {
        let a = deterministic_seed("engine:outbox", b"them:outbox:me:19000");
        let b = deterministic_seed("engine:outbox", b"them:outbox:me:19001");
        assert_ne!(a, b);
    }
}
