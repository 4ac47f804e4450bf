//! Addressbook record wire format (spec §4.6 Contacts / §4.6 Profile & Backup).
//!
//! A self-signed "latest value" broadcast of one identity's contact list,
//! published so the same identity can restore its contacts after a
//! reinstall -- same shape as [`crate::profile::ProfileRecord`], just
//! carrying a list instead of a single name.

use engine_crypto::Identity;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressbookEntry {
    pub fingerprint: String,
    pub nickname: Option<String>,
    pub verifying_key: Vec<u8>,
    pub kem_public: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressbookRecord {
    pub owner_fp: String,
    pub entries: Vec<AddressbookEntry>,
    pub updated_at_ms: u64,
    pub signature: Vec<u8>,
}

fn signable_bytes(owner_fp: &str, entries: &[AddressbookEntry], updated_at_ms: u64) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::new();
    buf.extend_from_slice(owner_fp.as_bytes());
    buf.extend_from_slice(&serde_json::to_vec(entries).map_err(|e| ProtocolError::Serialization(e.to_string()))?);
    buf.extend_from_slice(&updated_at_ms.to_le_bytes());
    Ok(buf)
}

pub fn build_addressbook_record(identity: &Identity, entries: Vec<AddressbookEntry>, updated_at_ms: u64) -> Result<AddressbookRecord, ProtocolError> {
    let owner_fp = identity.fingerprint();
    let signature = identity.sign_bytes(&signable_bytes(&owner_fp, &entries, updated_at_ms)?);
    Ok(AddressbookRecord { owner_fp, entries, updated_at_ms, signature })
}

/// Verify against the owner's own verifying key -- the caller, restoring
/// their own addressbook, already has it from the loaded identity rather
/// than from the record itself.
pub fn verify_addressbook_record(record: &AddressbookRecord, owner_verifying_key: &[u8]) -> Result<(), ProtocolError> {
    let signable = signable_bytes(&record.owner_fp, &record.entries, record.updated_at_ms)?;
    Identity::verify_bytes(owner_verifying_key, &signable, &record.signature).map_err(|e| ProtocolError::Verification(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addressbook_round_trips() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let entries = vec![AddressbookEntry {
            fingerprint: bob.fingerprint(),
            nickname: Some("Bobby".into()),
            verifying_key: bob.export_verifying_key(),
            kem_public: bob.export_kem_public(),
        }];
        let record = build_addressbook_record(&alice, entries, 1_000).unwrap();
        verify_addressbook_record(&record, &alice.export_verifying_key()).unwrap();
    }

    #[test]
    fn tampered_entries_rejected() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let mut record = build_addressbook_record(&alice, vec![], 1_000).unwrap();
        record.entries.push(AddressbookEntry {
            fingerprint: bob.fingerprint(),
            nickname: None,
            verifying_key: bob.export_verifying_key(),
            kem_public: bob.export_kem_public(),
        });
        assert!(verify_addressbook_record(&record, &alice.export_verifying_key()).is_err());
    }
}
