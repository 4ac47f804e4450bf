pub mod aead;
pub mod error;
pub mod identity;
pub mod keychain;
pub mod message;
pub mod mnemonic;

pub use error::CryptoError;
pub use identity::Identity;
pub use keychain::Keychain;
pub use message::SealedMessage;
