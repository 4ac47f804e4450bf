//! Profile record wire format (spec §4.6 Profile & Backup).
//!
//! A profile record is a single self-signed "latest value" broadcast under
//! `dht::keys::profile_keypair`, the same one-record-per-identity shape
//! `dht::presence` uses for online/offline -- unlike a [`crate::messaging::MessageEnvelope`]
//! it has no recipient and no encryption, since everything in it is meant to
//! be publicly readable by anyone who already knows the fingerprint.

use engine_crypto::Identity;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub fingerprint: String,
    pub registered_name: Option<String>,
    pub verifying_key: Vec<u8>,
    pub kem_public: Vec<u8>,
    pub updated_at_ms: u64,
    pub signature: Vec<u8>,
}

fn signable_bytes(fingerprint: &str, registered_name: Option<&str>, verifying_key: &[u8], kem_public: &[u8], updated_at_ms: u64) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(fingerprint.as_bytes());
    buf.extend_from_slice(registered_name.unwrap_or("").as_bytes());
    buf.extend_from_slice(verifying_key);
    buf.extend_from_slice(kem_public);
    buf.extend_from_slice(&updated_at_ms.to_le_bytes());
    buf
}

/// Build and self-sign a profile record for `identity`.
pub fn build_profile_record(identity: &Identity, registered_name: Option<&str>, updated_at_ms: u64) -> ProfileRecord {
    let fingerprint = identity.fingerprint();
    let verifying_key = identity.export_verifying_key();
    let kem_public = identity.export_kem_public();
    let signature = identity.sign_bytes(&signable_bytes(&fingerprint, registered_name, &verifying_key, &kem_public, updated_at_ms));
    ProfileRecord {
        fingerprint,
        registered_name: registered_name.map(str::to_string),
        verifying_key,
        kem_public,
        updated_at_ms,
        signature,
    }
}

/// Verify a profile record's self-signature against its own embedded
/// verifying key. A record's signer and subject are always the same party,
/// so there is no separate "known sender key" to check against -- a forger
/// would need the subject's ML-DSA secret key to produce a valid signature
/// over a substituted `verifying_key`/`kem_public` pair.
pub fn verify_profile_record(record: &ProfileRecord) -> Result<(), ProtocolError> {
    let signable = signable_bytes(
        &record.fingerprint,
        record.registered_name.as_deref(),
        &record.verifying_key,
        &record.kem_public,
        record.updated_at_ms,
    );
    Identity::verify_bytes(&record.verifying_key, &signable, &record.signature).map_err(|e| ProtocolError::Verification(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_record_round_trips() {
        let alice = Identity::generate();
        let record = build_profile_record(&alice, Some("alice"), 1_000);
        verify_profile_record(&record).unwrap();
        assert_eq!(record.fingerprint, alice.fingerprint());
    }

    #[test]
    fn tampered_name_is_rejected() {
        let alice = Identity::generate();
        let mut record = build_profile_record(&alice, Some("alice"), 1_000);
        record.registered_name = Some("mallory".to_string());
        assert!(verify_profile_record(&record).is_err());
    }

    #[test]
    fn substituted_keys_are_rejected() {
        let alice = Identity::generate();
        let mallory = Identity::generate();
        let mut record = build_profile_record(&alice, Some("alice"), 1_000);
        record.verifying_key = mallory.export_verifying_key();
        record.kem_public = mallory.export_kem_public();
        assert!(verify_profile_record(&record).is_err());
    }
}
