//! Flat-file key store (spec §4.1).
//!
//! Two layers: [`FileKeychain`] implements `engine_crypto::Keychain` as a
//! plain vault/key -> file mapping (no crypto of its own — just bytes on
//! disk). [`KeyStore`] sits above it and owns the Argon2id/AEAD-at-rest
//! encryption, the `WRONG_PASSWORD` / `PASSWORD_REQUIRED` distinction, and
//! atomic `change_password`.

use std::path::{Path, PathBuf};

use argon2::{Algorithm, Argon2, Params, Version};
use engine_crypto::keychain::{
    gek_key_name, Keychain, KEY_DSA_PRIVATE, KEY_KEM_PRIVATE, KEY_MNEMONIC, VAULT_GROUPS,
    VAULT_IDENTITY, VAULT_MNEMONIC,
};
use engine_crypto::{aead, CryptoError};
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::EngineError;

/// Maps `(vault, key)` onto the on-disk layout the core depends on (spec §6):
/// `keys/identity.dsa`, `keys/identity.kem`, `mnemonic.enc`, and a
/// `keys/groups/` directory for per-group GEKs.
pub struct FileKeychain {
    data_dir: PathBuf,
}

impl FileKeychain {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into() }
    }

    fn path_for(&self, vault: &str, key: &str) -> PathBuf {
        if vault == VAULT_IDENTITY && key == KEY_DSA_PRIVATE {
            self.data_dir.join("keys/identity.dsa")
        } else if vault == VAULT_IDENTITY && key == KEY_KEM_PRIVATE {
            self.data_dir.join("keys/identity.kem")
        } else if vault == VAULT_MNEMONIC && key == KEY_MNEMONIC {
            self.data_dir.join("mnemonic.enc")
        } else if vault == VAULT_GROUPS {
            self.data_dir.join("keys/groups").join(format!("{key}.bin"))
        } else {
            self.data_dir.join("keys").join(format!("{vault}_{key}.bin"))
        }
    }
}

impl Keychain for FileKeychain {
    fn store_key(&self, vault: &str, key: &str, data: &[u8]) -> Result<(), CryptoError> {
        let path = self.path_for(vault, key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CryptoError::StorageError(format!("create_dir_all {}: {e}", parent.display())))?;
        }
        std::fs::write(&path, data)
            .map_err(|e| CryptoError::StorageError(format!("write {}: {e}", path.display())))
    }

    fn load_key(&self, vault: &str, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        let path = self.path_for(vault, key);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CryptoError::StorageError(format!("read {}: {e}", path.display()))),
        }
    }

    fn delete_key(&self, vault: &str, key: &str) -> Result<(), CryptoError> {
        let path = self.path_for(vault, key);
        match std::fs::remove_file(&path) {
            Ok(()) | Err(_) if !path.exists() => Ok(()),
            Err(e) => Err(CryptoError::StorageError(format!("remove {}: {e}", path.display()))),
        }
    }

    fn key_exists(&self, vault: &str, key: &str) -> Result<bool, CryptoError> {
        Ok(self.path_for(vault, key).exists())
    }
}

const SALT_LEN: usize = 16;

/// Derive a 32-byte key from a session password with Argon2id. Parameters are
/// tuned down in `cfg(test)` builds for fast iteration, the same tradeoff the
/// upstream Stronghold-KDF override made for dev builds.
fn derive_key(password: &str, salt: &[u8]) -> [u8; 32] {
    #[cfg(test)]
    let params = Params::new(256, 1, 1, Some(32)).expect("valid argon2 params");
    #[cfg(not(test))]
    let params = Params::new(65536, 3, 4, Some(32)).expect("valid argon2 params");

    let hasher = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = [0u8; 32];
    hasher
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .expect("argon2 hash_password_into with fixed-size output cannot fail");
    key
}

/// `[0 flag-byte][plaintext]` for no password, `[1 flag-byte][16-byte salt][aead blob]` for one.
fn encode_blob(plaintext: &[u8], password: Option<&str>) -> Vec<u8> {
    match password {
        None => {
            let mut out = Vec::with_capacity(1 + plaintext.len());
            out.push(0);
            out.extend_from_slice(plaintext);
            out
        }
        Some(password) => {
            let mut salt = [0u8; SALT_LEN];
            rand::rngs::OsRng.fill_bytes(&mut salt);
            let mut key = derive_key(password, &salt);
            let sealed = aead::seal(&key, plaintext).expect("chacha20poly1305 seal is infallible for valid keys");
            key.zeroize();

            let mut out = Vec::with_capacity(1 + SALT_LEN + sealed.len());
            out.push(1);
            out.extend_from_slice(&salt);
            out.extend_from_slice(&sealed);
            out
        }
    }
}

fn decode_blob(blob: &[u8], password: Option<&str>) -> Result<Vec<u8>, EngineError> {
    let (flag, rest) = blob.split_first().ok_or(EngineError::Crypto("empty key file".into()))?;
    match flag {
        0 => Ok(rest.to_vec()),
        1 => {
            if rest.len() < SALT_LEN {
                return Err(EngineError::Crypto("truncated encrypted key file".into()));
            }
            let password = password.ok_or(EngineError::PasswordRequired)?;
            let (salt, sealed) = rest.split_at(SALT_LEN);
            let mut key = derive_key(password, salt);
            let plaintext = aead::open(&key, sealed).map_err(|_| EngineError::WrongPassword);
            key.zeroize();
            plaintext.map_err(|_| EngineError::WrongPassword)
        }
        _ => Err(EngineError::Crypto("unrecognized key file format".into())),
    }
}

/// The Key Store component (spec §4.1): loads/saves the identity key pairs
/// and mnemonic, encrypted at rest under an optional session password.
pub struct KeyStore {
    keychain: FileKeychain,
}

impl KeyStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { keychain: FileKeychain::new(data_dir) }
    }

    pub fn save_identity(
        &self,
        dsa_secret: &[u8],
        kem_secret: &[u8],
        password: Option<&str>,
    ) -> Result<(), EngineError> {
        self.keychain
            .store_key(VAULT_IDENTITY, KEY_DSA_PRIVATE, &encode_blob(dsa_secret, password))?;
        self.keychain
            .store_key(VAULT_IDENTITY, KEY_KEM_PRIVATE, &encode_blob(kem_secret, password))?;
        Ok(())
    }

    /// Returns `(dsa_secret, kem_secret)`, zeroize-on-drop owned by the caller.
    pub fn load_identity(&self, password: Option<&str>) -> Result<(Vec<u8>, Vec<u8>), EngineError> {
        let dsa = self
            .keychain
            .load_key(VAULT_IDENTITY, KEY_DSA_PRIVATE)?
            .ok_or_else(|| EngineError::NotFound("identity.dsa".into()))?;
        let kem = self
            .keychain
            .load_key(VAULT_IDENTITY, KEY_KEM_PRIVATE)?
            .ok_or_else(|| EngineError::NotFound("identity.kem".into()))?;
        Ok((decode_blob(&dsa, password)?, decode_blob(&kem, password)?))
    }

    pub fn save_mnemonic(&self, mnemonic: &str, password: Option<&str>) -> Result<(), EngineError> {
        self.keychain
            .store_key(VAULT_MNEMONIC, KEY_MNEMONIC, &encode_blob(mnemonic.as_bytes(), password))?;
        Ok(())
    }

    pub fn load_mnemonic(&self, password: Option<&str>) -> Result<String, EngineError> {
        let blob = self
            .keychain
            .load_key(VAULT_MNEMONIC, KEY_MNEMONIC)?
            .ok_or_else(|| EngineError::NotFound("mnemonic.enc".into()))?;
        let plaintext = decode_blob(&blob, password)?;
        String::from_utf8(plaintext).map_err(|e| EngineError::Crypto(e.to_string()))
    }

    pub fn save_gek(&self, group_id: &str, gek: &[u8], password: Option<&str>) -> Result<(), EngineError> {
        self.keychain
            .store_key(VAULT_GROUPS, &gek_key_name(group_id), &encode_blob(gek, password))?;
        Ok(())
    }

    pub fn load_gek(&self, group_id: &str, password: Option<&str>) -> Result<Option<Vec<u8>>, EngineError> {
        match self.keychain.load_key(VAULT_GROUPS, &gek_key_name(group_id))? {
            Some(blob) => Ok(Some(decode_blob(&blob, password)?)),
            None => Ok(None),
        }
    }

    /// Re-encrypts DSA, KEM and the mnemonic in order DSA -> KEM -> mnemonic.
    /// If step N fails, step N-1 is rolled back by re-applying the old
    /// password, and `CRYPTO` is reported (spec §4.1).
    pub fn change_password(&self, old: Option<&str>, new: Option<&str>) -> Result<(), EngineError> {
        let (dsa, kem) = self.load_identity(old)?;
        let mnemonic_present = self.keychain.key_exists(VAULT_MNEMONIC, KEY_MNEMONIC)?;
        let mnemonic = if mnemonic_present { Some(self.load_mnemonic(old)?) } else { None };

        self.keychain
            .store_key(VAULT_IDENTITY, KEY_DSA_PRIVATE, &encode_blob(&dsa, new))
            .map_err(EngineError::from)?;

        if let Err(e) = self
            .keychain
            .store_key(VAULT_IDENTITY, KEY_KEM_PRIVATE, &encode_blob(&kem, new))
        {
            // Roll back DSA to the old password.
            let _ = self
                .keychain
                .store_key(VAULT_IDENTITY, KEY_DSA_PRIVATE, &encode_blob(&dsa, old));
            return Err(EngineError::Crypto(e.to_string()));
        }

        if let Some(mnemonic) = mnemonic {
            if let Err(e) = self
                .keychain
                .store_key(VAULT_MNEMONIC, KEY_MNEMONIC, &encode_blob(mnemonic.as_bytes(), new))
            {
                let _ = self
                    .keychain
                    .store_key(VAULT_IDENTITY, KEY_KEM_PRIVATE, &encode_blob(&kem, old));
                let _ = self
                    .keychain
                    .store_key(VAULT_IDENTITY, KEY_DSA_PRIVATE, &encode_blob(&dsa, old));
                return Err(EngineError::Crypto(e.to_string()));
            }
        }

        Ok(())
    }

    /// Remove every on-disk artefact for this identity (spec §4.6 `delete_identity`).
    pub fn delete_all(&self, data_dir: &Path) -> Vec<String> {
        let mut errors = Vec::new();
        for rel in ["keys", "db", "mnemonic.enc", "dht_identity.bin"] {
            let path = data_dir.join(rel);
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            if let Err(e) = result {
                if e.kind() != std::io::ErrorKind::NotFound {
                    errors.push(format!("{rel}: {e}"));
                }
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn roundtrip_unencrypted() {
        let dir = TempDir::new().unwrap();
        let ks = KeyStore::new(dir.path());
        ks.save_identity(b"dsa-secret", b"kem-secret", None).unwrap();
        let (dsa, kem) = ks.load_identity(None).unwrap();
        assert_eq!(dsa, b"dsa-secret");
        assert_eq!(kem, b"kem-secret");
    }

    #[test]
    fn roundtrip_encrypted() {
        let dir = TempDir::new().unwrap();
        let ks = KeyStore::new(dir.path());
        ks.save_identity(b"dsa-secret", b"kem-secret", Some("hunter2")).unwrap();
        let (dsa, kem) = ks.load_identity(Some("hunter2")).unwrap();
        assert_eq!(dsa, b"dsa-secret");
        assert_eq!(kem, b"kem-secret");
    }

    #[test]
    fn missing_password_is_password_required() {
        let dir = TempDir::new().unwrap();
        let ks = KeyStore::new(dir.path());
        ks.save_identity(b"dsa-secret", b"kem-secret", Some("hunter2")).unwrap();
        let err = ks.load_identity(None).unwrap_err();
        assert!(matches!(err, EngineError::PasswordRequired));
    }

    #[test]
    fn wrong_password_rejected() {
        let dir = TempDir::new().unwrap();
        let ks = KeyStore::new(dir.path());
        ks.save_identity(b"dsa-secret", b"kem-secret", Some("hunter2")).unwrap();
        let err = ks.load_identity(Some("wrong")).unwrap_err();
        assert!(matches!(err, EngineError::WrongPassword));
    }

    #[test]
    fn change_password_reencrypts_all_files() {
        let dir = TempDir::new().unwrap();
        let ks = KeyStore::new(dir.path());
        ks.save_identity(b"dsa-secret", b"kem-secret", Some("old")).unwrap();
        ks.save_mnemonic("abandon ability able", Some("old")).unwrap();

        ks.change_password(Some("old"), Some("new")).unwrap();

        assert!(ks.load_identity(Some("old")).is_err());
        let (dsa, kem) = ks.load_identity(Some("new")).unwrap();
        assert_eq!(dsa, b"dsa-secret");
        assert_eq!(kem, b"kem-secret");
        assert_eq!(ks.load_mnemonic(Some("new")).unwrap(), "abandon ability able");
    }

    #[test]
    fn change_password_rolls_back_on_wrong_old_password() {
        let dir = TempDir::new().unwrap();
        let ks = KeyStore::new(dir.path());
        ks.save_identity(b"dsa-secret", b"kem-secret", Some("old")).unwrap();

        assert!(ks.change_password(Some("wrong"), Some("new")).is_err());
        // Original password still works — nothing was mutated.
        let (dsa, kem) = ks.load_identity(Some("old")).unwrap();
        assert_eq!(dsa, b"dsa-secret");
        assert_eq!(kem, b"kem-secret");
    }
}
