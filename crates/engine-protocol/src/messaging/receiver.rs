//! Parses and verifies envelopes read back out of the DHT (§4.8).
//!
//! Reading is a two-step trust problem: an envelope's signature can only be
//! checked once the caller knows the sender's ML-DSA verifying key. For
//! every kind except [`crate::messaging::envelope::EnvelopeKind::ContactRequest`]
//! that key must already be on file locally (from an earlier accepted
//! contact); contact requests carry their own key so first contact works.

use crate::error::ProtocolError;
use crate::messaging::envelope::{self, EnvelopeKind, MessageEnvelope, MessagePayload};

/// Deserialize a raw DHT subkey value into a [`MessageEnvelope`].
pub fn parse_envelope(data: &[u8]) -> Result<MessageEnvelope, ProtocolError> {
    serde_json::from_slice(data).map_err(|e| ProtocolError::Deserialization(format!("envelope parse failed: {e}")))
}

/// Verify an envelope whose sender is an already-known contact.
pub fn verify_known_sender(envelope: &MessageEnvelope, sender_verifying_key: &[u8]) -> Result<(), ProtocolError> {
    envelope::verify(envelope, sender_verifying_key)
}

/// Full read pipeline for an incoming, not-yet-contacted sender: parse,
/// pull the embedded verifying key out, and verify.
///
/// Returns `(envelope, sender_verifying_key)` on success. Only valid for
/// [`EnvelopeKind::ContactRequest`] envelopes.
pub fn process_contact_request(raw: &[u8]) -> Result<(MessageEnvelope, Vec<u8>), ProtocolError> {
    let envelope = parse_envelope(raw)?;
    if envelope.kind != EnvelopeKind::ContactRequest {
        return Err(ProtocolError::Deserialization("expected a contact request envelope".into()));
    }
    let sender_verifying_key = envelope::verifying_key_from_contact_request(&envelope)?;
    envelope::verify(&envelope, &sender_verifying_key)?;
    Ok((envelope, sender_verifying_key))
}

/// Full read pipeline for a message from an already-known contact: parse,
/// verify against the caller-supplied key, return the envelope unopened (the
/// caller decides how to decrypt based on `envelope.kind`).
pub fn process_incoming(raw: &[u8], sender_verifying_key: &[u8]) -> Result<MessageEnvelope, ProtocolError> {
    let envelope = parse_envelope(raw)?;
    envelope::verify(&envelope, sender_verifying_key)?;
    Ok(envelope)
}

/// Decrypt an already-verified direct-message or group-invite envelope.
pub fn open(identity: &engine_crypto::Identity, envelope: &MessageEnvelope) -> Result<MessagePayload, ProtocolError> {
    envelope::open(identity, envelope)
}

/// Decrypt an already-verified group-message envelope under its GEK.
pub fn open_group(gek: &[u8; 32], envelope: &MessageEnvelope) -> Result<MessagePayload, ProtocolError> {
    envelope::open_group(gek, envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_crypto::Identity;

    #[test]
    fn contact_request_pipeline_trusts_embedded_key() {
        let alice = Identity::generate();
        let envelope = envelope::build_contact_request(&alice, 1_000, "hi", "Alice").unwrap();
        let raw = serde_json::to_vec(&envelope).unwrap();

        let (parsed, sender_key) = process_contact_request(&raw).unwrap();
        assert_eq!(sender_key, alice.export_verifying_key());
        assert_eq!(parsed.sender_fp, alice.fingerprint());
    }

    #[test]
    fn known_sender_pipeline_rejects_wrong_key() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let envelope = envelope::build_direct_message(&alice, 1_000, bob.kem_encap_key(), "hi", "text").unwrap();
        let raw = serde_json::to_vec(&envelope).unwrap();

        let wrong_key = Identity::generate().export_verifying_key();
        assert!(process_incoming(&raw, &wrong_key).is_err());

        let envelope = process_incoming(&raw, &alice.export_verifying_key()).unwrap();
        let payload = open(&bob, &envelope).unwrap();
        match payload {
            MessagePayload::DirectMessage { body, .. } => assert_eq!(body, "hi"),
            _ => panic!("wrong payload variant"),
        }
    }
}
