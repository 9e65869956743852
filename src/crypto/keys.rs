//! ECDSA signature implementation
//!
//! Uses the secp256k1 curve. Transactions are a fixed pay-to-pubkey-hash
//! scheme: outputs commit to the BLAKE3 hash of a compressed SEC1 public
//! key, inputs reveal the key and sign the transaction's pre-signature
//! hash.

use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature as K256Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

use super::{hash_bytes, Hash};

/// Length of a compressed SEC1 public key.
pub const PUBLIC_KEY_LEN: usize = 33;

/// Length of a fixed-width ECDSA signature.
pub const SIGNATURE_LEN: usize = 64;

/// Key handling errors.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid private key")]
    InvalidPrivateKey,
    #[error("invalid signature encoding")]
    InvalidSignature,
}

/// Signing key; never leaves the local node.
#[derive(Clone)]
pub struct PrivateKey(SigningKey);

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKey([REDACTED])")
    }
}

/// Compressed SEC1 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_LEN]);

/// Fixed-width ECDSA signature (r || s).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EcdsaSignature(pub [u8; SIGNATURE_LEN]);

impl PrivateKey {
    /// Generate a new random private key.
    pub fn generate() -> Self {
        PrivateKey(SigningKey::random(&mut OsRng))
    }

    /// Create from 32 bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, KeyError> {
        SigningKey::from_slice(bytes)
            .map(PrivateKey)
            .map_err(|_| KeyError::InvalidPrivateKey)
    }

    /// Get the corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        use k256::elliptic_curve::sec1::ToEncodedPoint;
        let point = self.0.verifying_key().to_encoded_point(true);
        let mut bytes = [0u8; PUBLIC_KEY_LEN];
        bytes.copy_from_slice(point.as_bytes());
        PublicKey(bytes)
    }

    /// Sign a message digest.
    pub fn sign(&self, digest: &Hash) -> EcdsaSignature {
        let signature: K256Signature = self.0.sign(&digest.0);
        let mut bytes = [0u8; SIGNATURE_LEN];
        bytes.copy_from_slice(&signature.to_bytes());
        EcdsaSignature(bytes)
    }

    /// Export to bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&self.0.to_bytes());
        bytes
    }
}

impl PublicKey {
    /// Create from bytes, validating the curve point.
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_LEN]) -> Result<Self, KeyError> {
        VerifyingKey::from_sec1_bytes(bytes).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(PublicKey(*bytes))
    }

    /// Verify a signature over a message digest.
    pub fn verify(&self, digest: &Hash, signature: &EcdsaSignature) -> bool {
        let verifying_key = match VerifyingKey::from_sec1_bytes(&self.0) {
            Ok(vk) => vk,
            Err(_) => return false,
        };
        let signature = match K256Signature::from_slice(&signature.0) {
            Ok(s) => s,
            Err(_) => return false,
        };
        verifying_key.verify(&digest.0, &signature).is_ok()
    }

    /// The BLAKE3 hash outputs commit to.
    pub fn key_hash(&self) -> Hash {
        hash_bytes(&self.0)
    }
}

impl EcdsaSignature {
    /// Create from 64 bytes.
    pub fn from_bytes(bytes: [u8; SIGNATURE_LEN]) -> Self {
        EcdsaSignature(bytes)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

impl std::fmt::Debug for EcdsaSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({})", hex::encode(self.0))
    }
}
