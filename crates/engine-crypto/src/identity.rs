use ml_dsa::{KeyGen, MlDsa65, Signature as DsaSignature, SigningKey, VerifyingKey};
use ml_kem::kem::{Decapsulate, DecapsulationKey, Encapsulate, EncapsulationKey};
use ml_kem::{KemCore, MlKem768};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use sha3::{Digest, Sha3_512};
use signature::{Signer, Verifier};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// A loaded post-quantum identity: one ML-DSA-65 signature keypair plus one
/// ML-KEM-768 encapsulation keypair. The fingerprint everyone else addresses
/// this identity by is `SHA3-512(signing public key)`, hex-encoded.
///
/// There are no usernames or passwords at this layer — identity IS the keypair
/// pair. The signing key authenticates everything this identity publishes; the
/// KEM key lets other parties seal messages only this identity can open.
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    #[zeroize(skip)]
    signing_key: SigningKey<MlDsa65>,
    #[zeroize(skip)]
    verifying_key: VerifyingKey<MlDsa65>,
    #[zeroize(skip)]
    kem_decap_key: DecapsulationKey<MlKem768>,
    #[zeroize(skip)]
    kem_encap_key: EncapsulationKey<MlKem768>,
}

impl Identity {
    /// Generate a new random identity from OS entropy.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self::from_seeds(&seed, &seed)
    }

    /// Deterministically regenerate an identity from a signing seed and an
    /// encryption (KEM) seed, as required by `create_identity` (§4.6): the
    /// caller supplies independent seeds for each key pair so that wallet-style
    /// derivation from one mnemonic can produce the same identity twice.
    pub fn from_seeds(signing_seed: &[u8; 32], enc_seed: &[u8; 32]) -> Self {
        let mut dsa_rng = ChaCha20Rng::from_seed(*signing_seed);
        let dsa_kp = MlDsa65::key_gen(&mut dsa_rng);

        let mut kem_rng = ChaCha20Rng::from_seed(*enc_seed);
        let (kem_decap_key, kem_encap_key) = MlKem768::generate(&mut kem_rng);

        Self {
            signing_key: dsa_kp.signing_key().clone(),
            verifying_key: dsa_kp.verifying_key().clone(),
            kem_decap_key,
            kem_encap_key,
        }
    }

    /// The 128-hex fingerprint used everywhere as this identity's stable handle.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha3_512::digest(self.verifying_key.encode()))
    }

    pub fn verifying_key(&self) -> &VerifyingKey<MlDsa65> {
        &self.verifying_key
    }

    pub fn kem_encap_key(&self) -> &EncapsulationKey<MlKem768> {
        &self.kem_encap_key
    }

    /// Sign a message with this identity's ML-DSA private key.
    pub fn sign(&self, message: &[u8]) -> DsaSignature<MlDsa65> {
        self.signing_key.sign(message)
    }

    /// Verify a signature against a detached ML-DSA public key.
    pub fn verify(
        public_key: &VerifyingKey<MlDsa65>,
        message: &[u8],
        signature: &DsaSignature<MlDsa65>,
    ) -> Result<(), CryptoError> {
        public_key
            .verify(message, signature)
            .map_err(|e| CryptoError::VerificationError(e.to_string()))
    }

    /// Encapsulate a fresh shared secret to a recipient's KEM public key.
    /// Returns `(ciphertext, shared_secret)`; the ciphertext travels with the
    /// sealed payload so the recipient can decapsulate the same secret.
    pub fn seal_to(
        recipient_encap_key: &EncapsulationKey<MlKem768>,
    ) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        let mut rng = rand::rngs::OsRng;
        let (ciphertext, shared_secret) = recipient_encap_key
            .encapsulate(&mut rng)
            .map_err(|_| CryptoError::EncapsulationError("ml-kem encapsulate failed".into()))?;
        Ok((ciphertext.to_vec(), shared_secret.to_vec()))
    }

    /// Recover the shared secret this identity's KEM key was sealed against.
    pub fn open_seal(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let ct = ml_kem::Ciphertext::<MlKem768>::try_from(ciphertext)
            .map_err(|_| CryptoError::DecapsulationError("malformed ciphertext".into()))?;
        let shared_secret = self
            .kem_decap_key
            .decapsulate(&ct)
            .map_err(|_| CryptoError::DecapsulationError("ml-kem decapsulate failed".into()))?;
        Ok(shared_secret.to_vec())
    }

    /// Sign `message` and return the raw signature bytes, for embedding in
    /// wire payloads that don't want to depend on `ml_dsa` types directly.
    pub fn sign_bytes(&self, message: &[u8]) -> Vec<u8> {
        self.sign(message).encode().to_vec()
    }

    /// Verify a detached signature given raw public-key and signature bytes.
    pub fn verify_bytes(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let vk_bytes: &[u8; 1952] = public_key
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("ML-DSA-65 public key has wrong length".into()))?;
        let verifying_key = VerifyingKey::<MlDsa65>::decode(vk_bytes);
        let sig_bytes: &[u8; 3309] = signature
            .try_into()
            .map_err(|_| CryptoError::VerificationError("ML-DSA-65 signature has wrong length".into()))?;
        let signature = DsaSignature::<MlDsa65>::decode(sig_bytes);
        Self::verify(&verifying_key, message, &signature)
    }

    /// Raw bytes of this identity's ML-DSA verifying (public signing) key.
    pub fn export_verifying_key(&self) -> Vec<u8> {
        self.verifying_key.encode().to_vec()
    }

    /// Raw bytes of this identity's ML-KEM encapsulation (public encryption) key.
    pub fn export_kem_public(&self) -> Vec<u8> {
        self.kem_encap_key.as_bytes().to_vec()
    }

    /// Reconstruct an ML-KEM encapsulation key from exported bytes, for
    /// sealing a message to a peer whose public key arrived over the wire
    /// (e.g. embedded in a contact request).
    pub fn kem_public_from_bytes(bytes: &[u8]) -> Result<EncapsulationKey<MlKem768>, CryptoError> {
        let arr: &[u8; 1184] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("ML-KEM-768 public key has wrong length".into()))?;
        Ok(EncapsulationKey::<MlKem768>::from_bytes(arr))
    }

    /// Serialize both private key pairs for storage by the key store. Caller
    /// owns the returned buffers and must zeroise them after use.
    pub fn export_dsa_secret(&self) -> Vec<u8> {
        self.signing_key.encode().to_vec()
    }

    pub fn export_kem_secret(&self) -> Vec<u8> {
        self.kem_decap_key.as_bytes().to_vec()
    }

    /// Reconstruct an identity from previously-exported key bytes.
    pub fn from_exported(mut dsa_secret: Vec<u8>, mut kem_secret: Vec<u8>) -> Result<Self, CryptoError> {
        let signing_key = SigningKey::<MlDsa65>::decode(dsa_secret.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKey("ML-DSA secret key has wrong length".into())
        })?);
        let verifying_key = signing_key.verifying_key().clone();

        let kem_decap_key = DecapsulationKey::<MlKem768>::from_bytes(
            kem_secret
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKey("ML-KEM secret key has wrong length".into()))?,
        );
        let kem_encap_key = kem_decap_key.encapsulation_key();

        dsa_secret.zeroize();
        kem_secret.zeroize();

        Ok(Self {
            signing_key,
            verifying_key,
            kem_decap_key,
            kem_encap_key,
        })
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_and_sign() {
        let identity = Identity::generate();
        let message = b"hello engine";
        let signature = identity.sign(message);
        assert!(Identity::verify(identity.verifying_key(), message, &signature).is_ok());
    }

    #[test]
    fn deterministic_from_seeds() {
        let signing_seed = [7u8; 32];
        let enc_seed = [9u8; 32];
        let a = Identity::from_seeds(&signing_seed, &enc_seed);
        let b = Identity::from_seeds(&signing_seed, &enc_seed);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn different_seeds_different_fingerprint() {
        let a = Identity::from_seeds(&[1u8; 32], &[1u8; 32]);
        let b = Identity::from_seeds(&[2u8; 32], &[2u8; 32]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn seal_and_open_round_trip() {
        let bob = Identity::generate();
        let (ciphertext, secret_sender) = Identity::seal_to(bob.kem_encap_key()).unwrap();
        let secret_recipient = bob.open_seal(&ciphertext).unwrap();
        assert_eq!(secret_sender, secret_recipient);
    }

    #[test]
    fn sign_and_verify_detached_bytes() {
        let identity = Identity::generate();
        let signature = identity.sign_bytes(b"wire payload");
        let pubkey = identity.export_verifying_key();
        assert!(Identity::verify_bytes(&pubkey, b"wire payload", &signature).is_ok());
        assert!(Identity::verify_bytes(&pubkey, b"tampered", &signature).is_err());
    }

    #[test]
    fn kem_public_round_trips_through_bytes() {
        let bob = Identity::generate();
        let exported = bob.export_kem_public();
        let recovered = Identity::kem_public_from_bytes(&exported).unwrap();
        let (ciphertext, secret_sender) = Identity::seal_to(&recovered).unwrap();
        let secret_recipient = bob.open_seal(&ciphertext).unwrap();
        assert_eq!(secret_sender, secret_recipient);
    }

    #[test]
    fn export_and_restore() {
        let original = Identity::generate();
        let fp = original.fingerprint();
        let dsa = original.export_dsa_secret();
        let kem = original.export_kem_secret();
        let restored = Identity::from_exported(dsa, kem).unwrap();
        assert_eq!(fp, restored.fingerprint());
    }
}
