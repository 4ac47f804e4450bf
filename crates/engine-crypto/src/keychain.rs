use crate::CryptoError;

/// Trait for key storage — abstracts over the actual backend.
///
/// The headless engine implements this against a flat-file, Argon2id/AEAD
/// encrypted layout (see `engine::keystore`). This crate has zero knowledge
/// of that backend; it only defines the seam.
pub trait Keychain: Send + Sync {
    /// Store a key under a vault/key pair.
    fn store_key(&self, vault: &str, key: &str, data: &[u8]) -> Result<(), CryptoError>;

    /// Retrieve a key from a vault/key pair.
    fn load_key(&self, vault: &str, key: &str) -> Result<Option<Vec<u8>>, CryptoError>;

    /// Delete a key from a vault/key pair.
    fn delete_key(&self, vault: &str, key: &str) -> Result<(), CryptoError>;

    /// Check if a key exists.
    fn key_exists(&self, vault: &str, key: &str) -> Result<bool, CryptoError>;
}

// Vault and key constants used throughout the engine.

/// Vault for identity keys.
pub const VAULT_IDENTITY: &str = "identity";
/// ML-DSA signing private key.
pub const KEY_DSA_PRIVATE: &str = "dsa_private";
/// ML-KEM decapsulation private key.
pub const KEY_KEM_PRIVATE: &str = "kem_private";

/// Vault for the BIP-39 mnemonic backing key derivation.
pub const VAULT_MNEMONIC: &str = "mnemonic";
pub const KEY_MNEMONIC: &str = "phrase";

/// Vault for group encryption keys (GEKs), one entry per group.
pub const VAULT_GROUPS: &str = "groups";

/// Generate the GEK key name for a group.
pub fn gek_key_name(group_id: &str) -> String {
    format!("gek_{group_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gek_key_name_is_namespaced() {
        assert_eq!(gek_key_name("abc"), "gek_abc");
    }
}
