use hkdf::Hkdf;
use ml_kem::kem::EncapsulationKey;
use ml_kem::MlKem768;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::aead;
use crate::error::CryptoError;
use crate::identity::Identity;

/// A message payload sealed to a single recipient's ML-KEM public key.
///
/// Hybrid construction: the sender encapsulates a fresh shared secret to the
/// recipient's KEM key, derives a one-time symmetric key from it with
/// HKDF-SHA256, and seals the plaintext under that key with ChaCha20-Poly1305.
/// The KEM ciphertext travels alongside the AEAD ciphertext so the recipient
/// can recover the same symmetric key by decapsulating with their secret key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedMessage {
    pub kem_ciphertext: Vec<u8>,
    pub aead_ciphertext: Vec<u8>,
}

fn derive_symmetric_key(shared_secret: &[u8], info: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; 32];
    hk.expand(info, &mut key)
        .expect("32-byte output is valid for HKDF-SHA256");
    key
}

const MESSAGE_INFO: &[u8] = b"engine-direct-message-v1";
const GROUP_KEY_WRAP_INFO: &[u8] = b"engine-group-key-wrap-v1";

/// Seal `plaintext` so that only the holder of `recipient_kem_public`'s secret
/// key can recover it.
pub fn seal_for_recipient(
    recipient_kem_public: &EncapsulationKey<MlKem768>,
    plaintext: &[u8],
) -> Result<SealedMessage, CryptoError> {
    let (kem_ciphertext, shared_secret) = Identity::seal_to(recipient_kem_public)?;
    let key = derive_symmetric_key(&shared_secret, MESSAGE_INFO);
    let aead_ciphertext = aead::seal(&key, plaintext)?;
    Ok(SealedMessage {
        kem_ciphertext,
        aead_ciphertext,
    })
}

/// Recover the plaintext of a [`SealedMessage`] addressed to `identity`.
pub fn open_as_recipient(identity: &Identity, sealed: &SealedMessage) -> Result<Vec<u8>, CryptoError> {
    let shared_secret = identity.open_seal(&sealed.kem_ciphertext)?;
    let key = derive_symmetric_key(&shared_secret, MESSAGE_INFO);
    aead::open(&key, &sealed.aead_ciphertext)
}

/// Wrap a 32-byte group encryption key (GEK) for one group member, so it can
/// be distributed on the DHT without ever appearing in plaintext.
pub fn wrap_group_key(
    member_kem_public: &EncapsulationKey<MlKem768>,
    gek: &[u8; 32],
) -> Result<SealedMessage, CryptoError> {
    let (kem_ciphertext, shared_secret) = Identity::seal_to(member_kem_public)?;
    let key = derive_symmetric_key(&shared_secret, GROUP_KEY_WRAP_INFO);
    let aead_ciphertext = aead::seal(&key, gek)?;
    Ok(SealedMessage {
        kem_ciphertext,
        aead_ciphertext,
    })
}

/// Unwrap a GEK previously wrapped with [`wrap_group_key`] for `identity`.
pub fn unwrap_group_key(identity: &Identity, wrapped: &SealedMessage) -> Result<[u8; 32], CryptoError> {
    let shared_secret = identity.open_seal(&wrapped.kem_ciphertext)?;
    let key = derive_symmetric_key(&shared_secret, GROUP_KEY_WRAP_INFO);
    let plaintext = aead::open(&key, &wrapped.aead_ciphertext)?;
    plaintext
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("unwrapped GEK is not 32 bytes".into()))
}
