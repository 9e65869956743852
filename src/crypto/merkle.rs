//! Merkle tree implementation
//!
//! Blocks commit to their transactions through a tree of stored
//! [`MerkleNode`] entities. Construction is deterministic: leaves pair up
//! level by level, an odd trailing entry pairs with itself, and a single
//! leaf becomes one self-paired node. Because node identity is the hash of
//! the children, the tree is acyclic by construction.

use crate::codec::{expect_end, get_hash, put_hash, WireError};

use super::{double_hash, Hash};

/// An internal tree node; both children are ids of either a transaction or
/// another merkle node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MerkleNode {
    pub left: Hash,
    pub right: Hash,
}

impl MerkleNode {
    /// Encoded length: two hashes.
    pub const ENCODED_LEN: u64 = 64;

    pub fn new(left: Hash, right: Hash) -> Self {
        Self { left, right }
    }

    /// A node whose children are the same id carries that subtree once.
    pub fn is_self_pair(&self) -> bool {
        self.left == self.right
    }

    /// Content identity: double hash of the canonical encoding.
    pub fn id(&self) -> Hash {
        double_hash(&self.encode())
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        put_hash(buf, &self.left);
        put_hash(buf, &self.right);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::ENCODED_LEN as usize);
        self.encode_into(&mut buf);
        buf
    }

    pub fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        let left = get_hash(input)?;
        let right = get_hash(input)?;
        Ok(Self { left, right })
    }

    /// Decode a node that must occupy the whole input.
    pub fn decode_exact(mut input: &[u8]) -> Result<Self, WireError> {
        let node = Self::decode(&mut input)?;
        expect_end(input)?;
        Ok(node)
    }
}

/// A freshly built tree: the root id plus every node, children before
/// parents.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    pub root: Hash,
    pub nodes: Vec<MerkleNode>,
}

/// Build the deterministic merkle tree over an ordered transaction id list.
///
/// Returns `None` for an empty list. The node list is emitted bottom-up so
/// storing it in order always satisfies child-existence checks.
pub fn merkle_from_tx_ids(tx_ids: &[Hash]) -> Option<MerkleTree> {
    if tx_ids.is_empty() {
        return None;
    }

    let mut nodes = Vec::new();

    if tx_ids.len() == 1 {
        let node = MerkleNode::new(tx_ids[0], tx_ids[0]);
        let root = node.id();
        nodes.push(node);
        return Some(MerkleTree { root, nodes });
    }

    let mut level: Vec<Hash> = tx_ids.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for chunk in level.chunks(2) {
            let left = chunk[0];
            let right = if chunk.len() == 2 { chunk[1] } else { chunk[0] };
            let node = MerkleNode::new(left, right);
            next.push(node.id());
            nodes.push(node);
        }
        level = next;
    }

    Some(MerkleTree {
        root: level[0],
        nodes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_bytes;

    fn make_ids(n: usize) -> Vec<Hash> {
        (0..n).map(|i| hash_bytes(&i.to_be_bytes())).collect()
    }

    #[test]
    fn test_empty_list_has_no_tree() {
        assert!(merkle_from_tx_ids(&[]).is_none());
    }

    #[test]
    fn test_single_leaf_self_pairs() {
        let ids = make_ids(1);
        let tree = merkle_from_tx_ids(&ids).unwrap();
        assert_eq!(tree.nodes.len(), 1);
        assert!(tree.nodes[0].is_self_pair());
        assert_eq!(tree.nodes[0].left, ids[0]);
        assert_eq!(tree.root, tree.nodes[0].id());
    }

    #[test]
    fn test_two_leaves() {
        let ids = make_ids(2);
        let tree = merkle_from_tx_ids(&ids).unwrap();
        assert_eq!(tree.nodes.len(), 1);
        assert_eq!(tree.root, MerkleNode::new(ids[0], ids[1]).id());
    }

    #[test]
    fn test_odd_leaf_self_pairs() {
        let ids = make_ids(3);
        let tree = merkle_from_tx_ids(&ids).unwrap();
        assert_eq!(tree.nodes.len(), 3);
        assert!(tree.nodes[1].is_self_pair());
    }

    #[test]
    fn test_deterministic_and_order_sensitive() {
        let ids = make_ids(7);
        let a = merkle_from_tx_ids(&ids).unwrap();
        let b = merkle_from_tx_ids(&ids).unwrap();
        assert_eq!(a.root, b.root);

        let mut reversed = ids.clone();
        reversed.reverse();
        let c = merkle_from_tx_ids(&reversed).unwrap();
        assert_ne!(a.root, c.root);
    }

    #[test]
    fn test_children_emitted_before_parents() {
        let ids = make_ids(6);
        let tree = merkle_from_tx_ids(&ids).unwrap();
        for (index, node) in tree.nodes.iter().enumerate() {
            for child in [node.left, node.right] {
                if let Some(pos) = tree.nodes.iter().position(|n| n.id() == child) {
                    assert!(pos < index);
                }
            }
        }
    }

    #[test]
    fn test_encode_roundtrip() {
        let node = MerkleNode::new(hash_bytes(b"l"), hash_bytes(b"r"));
        let bytes = node.encode();
        assert_eq!(bytes.len() as u64, MerkleNode::ENCODED_LEN);
        assert_eq!(MerkleNode::decode_exact(&bytes).unwrap(), node);
    }
}
