use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand_core::RngCore;

use crate::error::CryptoError;

const NONCE_LEN: usize = 12;

/// Seal `plaintext` under a 32-byte symmetric key with ChaCha20-Poly1305.
///
/// Returns `[12-byte nonce || ciphertext || 16-byte tag]`. Used wherever the
/// engine needs symmetric-key-at-rest or symmetric-key-in-transit encryption:
/// identity file encryption, group message payloads, wrapped GEKs.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open data produced by [`seal`].
pub fn open(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_LEN + 16 {
        return Err(CryptoError::DecryptionError("ciphertext too short".into()));
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|e| CryptoError::DecryptionError(e.to_string()))?;

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| CryptoError::DecryptionError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = [3u8; 32];
        let ct = seal(&key, b"hello").unwrap();
        assert_eq!(open(&key, &ct).unwrap(), b"hello");
    }

    #[test]
    fn wrong_key_fails() {
        let ct = seal(&[1u8; 32], b"secret").unwrap();
        assert!(open(&[2u8; 32], &ct).is_err());
    }

    #[test]
    fn truncated_rejected() {
        assert!(open(&[1u8; 32], &[0u8; 4]).is_err());
    }
}
