use engine_crypto::message::SealedMessage;
use engine_crypto::Identity;
use ml_kem::kem::EncapsulationKey;
use ml_kem::MlKem768;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Wire envelope wrapping every message this core deposits on the DHT
/// (DM outboxes, contact-request inboxes, group topics).
///
/// Every envelope is signed by the sender's ML-DSA key over
/// `(sender_fp || timestamp_ms || nonce || kind-tag || body)`. `body` is
/// plaintext JSON for contact requests (the recipient has no shared secret
/// with us yet) and ciphertext for everything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub sender_fp: String,
    pub timestamp_ms: u64,
    pub nonce: Vec<u8>,
    pub kind: EnvelopeKind,
    pub body: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    DirectMessage,
    ContactRequest,
    GroupMessage,
    GroupInvite,
}

/// Decrypted/verified payload of a [`MessageEnvelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessagePayload {
    DirectMessage {
        body: String,
        message_type: String,
    },
    /// Also used for the reciprocal auto-approval handshake (§4.6): the
    /// receiving side detects that by comparing `message` against the
    /// reserved literal [`CONTACT_REQUEST_ACCEPTED`].
    ContactRequest {
        message: String,
        sender_name: String,
        sender_verifying_key: Vec<u8>,
        sender_kem_public: Vec<u8>,
    },
    GroupMessage {
        group_id: String,
        body: String,
    },
    GroupInvite {
        group_id: String,
        group_name: String,
        wrapped_gek: SealedMessage,
        members: Vec<GroupRosterEntry>,
    },
}

/// One group member's identity, as carried inside a [`MessagePayload::GroupInvite`]
/// so the invitee can verify/seal to every other member without first adding
/// each of them as a direct contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRosterEntry {
    pub fingerprint: String,
    pub verifying_key: Vec<u8>,
    pub kem_public: Vec<u8>,
}

/// The reserved message text that auto-approves a reciprocal contact request.
pub const CONTACT_REQUEST_ACCEPTED: &str = "Contact request accepted";

fn fresh_nonce() -> Vec<u8> {
    let mut nonce = vec![0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

fn signable_bytes(sender_fp: &str, timestamp_ms: u64, nonce: &[u8], kind: EnvelopeKind, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(sender_fp.len() + 8 + nonce.len() + body.len() + 1);
    buf.extend_from_slice(sender_fp.as_bytes());
    buf.extend_from_slice(&timestamp_ms.to_le_bytes());
    buf.extend_from_slice(nonce);
    buf.push(kind as u8);
    buf.extend_from_slice(body);
    buf
}

fn sign_envelope(identity: &Identity, timestamp_ms: u64, nonce: Vec<u8>, kind: EnvelopeKind, body: Vec<u8>) -> MessageEnvelope {
    let sender_fp = identity.fingerprint();
    let signature = identity.sign_bytes(&signable_bytes(&sender_fp, timestamp_ms, &nonce, kind, &body));
    MessageEnvelope {
        sender_fp,
        timestamp_ms,
        nonce,
        kind,
        body,
        signature,
    }
}

/// Build a direct-message envelope, sealed to the recipient's ML-KEM key.
pub fn build_direct_message(
    identity: &Identity,
    timestamp_ms: u64,
    recipient_kem_public: &EncapsulationKey<MlKem768>,
    body: &str,
    message_type: &str,
) -> Result<MessageEnvelope, ProtocolError> {
    let payload = MessagePayload::DirectMessage {
        body: body.to_string(),
        message_type: message_type.to_string(),
    };
    let plaintext = serde_json::to_vec(&payload).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    let sealed = engine_crypto::message::seal_for_recipient(recipient_kem_public, &plaintext)?;
    let body = serde_json::to_vec(&sealed).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    Ok(sign_envelope(identity, timestamp_ms, fresh_nonce(), EnvelopeKind::DirectMessage, body))
}

/// Build a contact-request envelope. Unsealed (the recipient has no shared
/// secret with us yet) but signed, and self-describing: it carries the
/// sender's public keys so the recipient can encrypt a reply and verify us
/// on every subsequent message.
pub fn build_contact_request(
    identity: &Identity,
    timestamp_ms: u64,
    message: &str,
    sender_name: &str,
) -> Result<MessageEnvelope, ProtocolError> {
    let payload = MessagePayload::ContactRequest {
        message: message.to_string(),
        sender_name: sender_name.to_string(),
        sender_verifying_key: identity.export_verifying_key(),
        sender_kem_public: identity.export_kem_public(),
    };
    let body = serde_json::to_vec(&payload).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    Ok(sign_envelope(identity, timestamp_ms, fresh_nonce(), EnvelopeKind::ContactRequest, body))
}

/// Build a group-message envelope, sealed symmetrically under the group's GEK.
pub fn build_group_message(
    identity: &Identity,
    timestamp_ms: u64,
    group_id: &str,
    gek: &[u8; 32],
    body: &str,
) -> Result<MessageEnvelope, ProtocolError> {
    let payload = MessagePayload::GroupMessage {
        group_id: group_id.to_string(),
        body: body.to_string(),
    };
    let plaintext = serde_json::to_vec(&payload).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    let ciphertext = engine_crypto::aead::seal(gek, &plaintext)?;
    Ok(sign_envelope(identity, timestamp_ms, fresh_nonce(), EnvelopeKind::GroupMessage, ciphertext))
}

/// Build a group-invite envelope, wrapping the GEK to one member's KEM key.
#[allow(clippy::too_many_arguments)]
pub fn build_group_invite(
    identity: &Identity,
    timestamp_ms: u64,
    group_id: &str,
    group_name: &str,
    gek: &[u8; 32],
    member_kem_public: &EncapsulationKey<MlKem768>,
    members: Vec<GroupRosterEntry>,
) -> Result<MessageEnvelope, ProtocolError> {
    let wrapped_gek = engine_crypto::message::wrap_group_key(member_kem_public, gek)?;
    let payload = MessagePayload::GroupInvite {
        group_id: group_id.to_string(),
        group_name: group_name.to_string(),
        wrapped_gek,
        members,
    };
    let body = serde_json::to_vec(&payload).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    Ok(sign_envelope(identity, timestamp_ms, fresh_nonce(), EnvelopeKind::GroupInvite, body))
}

/// Verify an envelope's signature against the sender's known verifying key.
///
/// For [`EnvelopeKind::ContactRequest`] the verifying key travels inside the
/// envelope body itself (first contact — there is nothing else to check it
/// against); callers should use [`verifying_key_from_contact_request`] first.
pub fn verify(envelope: &MessageEnvelope, sender_verifying_key: &[u8]) -> Result<(), ProtocolError> {
    let signable = signable_bytes(
        &envelope.sender_fp,
        envelope.timestamp_ms,
        &envelope.nonce,
        envelope.kind,
        &envelope.body,
    );
    Identity::verify_bytes(sender_verifying_key, &signable, &envelope.signature)
        .map_err(|e| ProtocolError::Verification(e.to_string()))
}

/// Peek the sender's verifying key out of an (unverified) contact-request
/// envelope body, so the caller can verify the envelope's signature against
/// it before trusting anything else in the payload.
pub fn verifying_key_from_contact_request(envelope: &MessageEnvelope) -> Result<Vec<u8>, ProtocolError> {
    if envelope.kind != EnvelopeKind::ContactRequest {
        return Err(ProtocolError::Deserialization("not a contact request envelope".into()));
    }
    let payload: MessagePayload = serde_json::from_slice(&envelope.body)
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    match payload {
        MessagePayload::ContactRequest { sender_verifying_key, .. } => Ok(sender_verifying_key),
        _ => Err(ProtocolError::Deserialization("contact request payload mismatch".into())),
    }
}

/// Decrypt and parse a verified envelope's body into its [`MessagePayload`].
/// Not valid for [`EnvelopeKind::GroupMessage`]; use [`open_group`] instead.
pub fn open(identity: &Identity, envelope: &MessageEnvelope) -> Result<MessagePayload, ProtocolError> {
    let plaintext = match envelope.kind {
        EnvelopeKind::ContactRequest => envelope.body.clone(),
        EnvelopeKind::DirectMessage | EnvelopeKind::GroupInvite => {
            let sealed: SealedMessage = serde_json::from_slice(&envelope.body)
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
            engine_crypto::message::open_as_recipient(identity, &sealed)?
        }
        EnvelopeKind::GroupMessage => {
            return Err(ProtocolError::Internal(
                "group messages must be opened with open_group, not open".into(),
            ));
        }
    };
    serde_json::from_slice(&plaintext).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

/// Decrypt a group-message envelope using the group's symmetric GEK.
pub fn open_group(gek: &[u8; 32], envelope: &MessageEnvelope) -> Result<MessagePayload, ProtocolError> {
    if envelope.kind != EnvelopeKind::GroupMessage {
        return Err(ProtocolError::Deserialization("not a group message envelope".into()));
    }
    let plaintext = engine_crypto::aead::open(gek, &envelope.body)?;
    serde_json::from_slice(&plaintext).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_message_round_trips() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let envelope = build_direct_message(&alice, 1_000, bob.kem_encap_key(), "hi", "text").unwrap();
        verify(&envelope, &alice.export_verifying_key()).unwrap();
        let payload = open(&bob, &envelope).unwrap();
        match payload {
            MessagePayload::DirectMessage { body, .. } => assert_eq!(body, "hi"),
            _ => panic!("wrong payload variant"),
        }
    }

    #[test]
    fn contact_request_self_describes_and_verifies() {
        let alice = Identity::generate();
        let envelope = build_contact_request(&alice, 1_000, CONTACT_REQUEST_ACCEPTED, "Alice").unwrap();
        let vk = verifying_key_from_contact_request(&envelope).unwrap();
        assert_eq!(vk, alice.export_verifying_key());
        verify(&envelope, &vk).unwrap();
    }

    #[test]
    fn tampered_body_rejected() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let mut envelope = build_direct_message(&alice, 1_000, bob.kem_encap_key(), "hi", "text").unwrap();
        envelope.body.push(0);
        assert!(verify(&envelope, &alice.export_verifying_key()).is_err());
    }

    #[test]
    fn group_message_round_trips() {
        let alice = Identity::generate();
        let gek = [9u8; 32];
        let envelope = build_group_message(&alice, 1_000, "group-1", &gek, "sup").unwrap();
        verify(&envelope, &alice.export_verifying_key()).unwrap();
        let payload = open_group(&gek, &envelope).unwrap();
        match payload {
            MessagePayload::GroupMessage { body, group_id } => {
                assert_eq!(body, "sup");
                assert_eq!(group_id, "group-1");
            }
            _ => panic!("wrong payload variant"),
        }
    }
}
