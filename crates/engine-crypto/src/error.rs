use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("signing failed: {0}")]
    SigningError(String),

    #[error("verification failed: {0}")]
    VerificationError(String),

    #[error("encryption failed: {0}")]
    EncryptionError(String),

    #[error("decryption failed: {0}")]
    DecryptionError(String),

    #[error("key encapsulation failed: {0}")]
    EncapsulationError(String),

    #[error("key decapsulation failed: {0}")]
    DecapsulationError(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    #[error("wrong password")]
    WrongPassword,

    #[error("password required")]
    PasswordRequired,

    #[error("key storage error: {0}")]
    StorageError(String),
}
