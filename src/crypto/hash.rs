//! BLAKE3 hashing implementation
//!
//! All hashing in Pyrite uses BLAKE3. Entity identities are double hashes
//! of the canonical encoding; public key hashes are single hashes. A hash
//! doubles as a proof-of-work target, compared as a big-endian unsigned
//! integer.

use crate::U256;
use std::fmt;

/// 32-byte hash output.
///
/// The derived ordering is lexicographic over the bytes, which is exactly
/// big-endian unsigned integer ordering. The all-zero value is reserved as
/// the genesis-parent / no-value sentinel.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// The zero sentinel (genesis parent, protocol terminator).
    pub const fn zero() -> Self {
        Hash([0u8; 32])
    }

    /// Whether this is the zero sentinel.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Create hash from bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }

    /// Create hash from hex string.
    pub fn from_hex(hex: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Hash(arr))
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Get as bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Interpret the bytes as a big-endian 256-bit integer.
    pub fn to_u256(&self) -> U256 {
        U256::from_big_endian(&self.0)
    }

    /// Build a hash from a big-endian 256-bit integer.
    pub fn from_u256(value: U256) -> Self {
        Hash(value.to_big_endian())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Default for Hash {
    fn default() -> Self {
        Self::zero()
    }
}

/// Hash arbitrary bytes using BLAKE3.
pub fn hash_bytes(data: &[u8]) -> Hash {
    let hash = blake3::hash(data);
    Hash(*hash.as_bytes())
}

/// Double hash (hash of hash), used for entity identities.
pub fn double_hash(data: &[u8]) -> Hash {
    let first = hash_bytes(data);
    hash_bytes(&first.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        let data = b"hello world";
        assert_eq!(hash_bytes(data), hash_bytes(data));
    }

    #[test]
    fn test_hash_different_inputs() {
        assert_ne!(hash_bytes(b"hello"), hash_bytes(b"world"));
    }

    #[test]
    fn test_double_hash_differs_from_single() {
        let data = b"payload";
        assert_ne!(hash_bytes(data), double_hash(data));
    }

    #[test]
    fn test_zero_hash() {
        assert!(Hash::zero().is_zero());
        assert!(!hash_bytes(b"x").is_zero());
    }

    #[test]
    fn test_hex_roundtrip() {
        let hash = hash_bytes(b"test");
        let recovered = Hash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, recovered);
    }

    #[test]
    fn test_ordering_is_big_endian() {
        let mut low = [0u8; 32];
        low[31] = 0xff;
        let mut high = [0u8; 32];
        high[0] = 0x01;
        assert!(Hash(low) < Hash(high));
        assert_eq!(Hash(low).to_u256(), U256::from(0xffu64));
    }

    #[test]
    fn test_u256_roundtrip() {
        let hash = hash_bytes(b"u256");
        assert_eq!(Hash::from_u256(hash.to_u256()), hash);
    }
}
