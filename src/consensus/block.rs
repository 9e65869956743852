//! Block structure
//!
//! A block commits to its parent, its transactions through a merkle root,
//! and a proof-of-work target its own identity must beat. `noise` is
//! miner-chosen entropy re-rolled when the 64-bit nonce space runs out.

use crate::codec::{expect_end, get_hash, get_u64, put_hash, put_u64, WireError};
use crate::crypto::{double_hash, Hash};

/// A block header; transactions live in the inventory behind `merkle_root`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// Identity of the parent block, zero for the first block.
    pub prev_id: Hash,
    /// Root of the merkle tree over the contained transaction ids.
    pub merkle_root: Hash,
    /// The proof-of-work target this block claims to satisfy.
    pub target: Hash,
    /// Miner-chosen entropy extending the nonce search space.
    pub noise: Hash,
    /// Proof-of-work counter.
    pub nonce: u64,
    /// Unix timestamp the miner stamped the block with.
    pub mined_time: u64,
}

impl Block {
    /// Encoded length: four hashes and two integers.
    pub const ENCODED_LEN: u64 = 144;

    /// Content identity: double hash of the canonical encoding.
    pub fn id(&self) -> Hash {
        double_hash(&self.encode())
    }

    /// Whether the identity beats the claimed target.
    pub fn meets_target(&self) -> bool {
        self.id() < self.target
    }

    /// Whether this block claims the zero sentinel as parent.
    pub fn is_genesis(&self) -> bool {
        self.prev_id.is_zero()
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        put_hash(buf, &self.prev_id);
        put_hash(buf, &self.merkle_root);
        put_hash(buf, &self.target);
        put_hash(buf, &self.noise);
        put_u64(buf, self.nonce);
        put_u64(buf, self.mined_time);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::ENCODED_LEN as usize);
        self.encode_into(&mut buf);
        buf
    }

    pub fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            prev_id: get_hash(input)?,
            merkle_root: get_hash(input)?,
            target: get_hash(input)?,
            noise: get_hash(input)?,
            nonce: get_u64(input)?,
            mined_time: get_u64(input)?,
        })
    }

    /// Decode a block that must occupy the whole input.
    pub fn decode_exact(mut input: &[u8]) -> Result<Self, WireError> {
        let block = Self::decode(&mut input)?;
        expect_end(input)?;
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_bytes;

    fn sample_block() -> Block {
        Block {
            prev_id: Hash::zero(),
            merkle_root: hash_bytes(b"merkle"),
            target: Hash([0xff; 32]),
            noise: hash_bytes(b"noise"),
            nonce: 42,
            mined_time: 1_700_000_000,
        }
    }

    #[test]
    fn test_encoded_length() {
        assert_eq!(sample_block().encode().len() as u64, Block::ENCODED_LEN);
    }

    #[test]
    fn test_encode_roundtrip() {
        let block = sample_block();
        let decoded = Block::decode_exact(&block.encode()).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.id(), block.id());
    }

    #[test]
    fn test_id_changes_with_nonce() {
        let block = sample_block();
        let mut other = block;
        other.nonce += 1;
        assert_ne!(block.id(), other.id());
    }

    #[test]
    fn test_meets_target() {
        let mut block = sample_block();
        block.target = Hash([0xff; 32]);
        assert!(block.meets_target());
        block.target = Hash::zero();
        assert!(!block.meets_target());
    }

    #[test]
    fn test_genesis_detection() {
        let block = sample_block();
        assert!(block.is_genesis());
        let mut child = block;
        child.prev_id = block.id();
        assert!(!child.is_genesis());
    }
}
