//! Property-based and adversarial tests for the Pyrite core
//!
//! These verify structural invariants under random inputs: merkle tree
//! shape and decomposition, retarget clamping, canonical encoding and
//! record round-trips, and double-spend rejection.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use proptest::prelude::*;
use pyrite_core::consensus::{retarget, Block};
use pyrite_core::crypto::{hash_bytes, merkle_from_tx_ids, Hash, MerkleNode, MerkleTree};
use pyrite_core::crypto::{EcdsaSignature, PrivateKey, PublicKey};
use pyrite_core::mining;
use pyrite_core::params::Params;
use pyrite_core::storage::records::{
    format_block_record, format_merkle_record, format_tx_record, parse_block_record,
    parse_merkle_record, parse_tx_record,
};
use pyrite_core::storage::{ChainState, Inventory, StoredBlock, StoredMerkle, StoredTx};
use pyrite_core::validation::{sig_hash, signed_input, Tx, TxIn, TxOut, Utxo};
use pyrite_core::U256;

/// Walk a freshly built tree back down to its leaf sequence, the same way
/// the inventory decomposes a stored root.
fn decompose(tree: &MerkleTree) -> Vec<Hash> {
    let by_id: HashMap<Hash, MerkleNode> = tree.nodes.iter().map(|n| (n.id(), *n)).collect();
    let mut queue = VecDeque::from([tree.root]);
    let mut leaves = Vec::new();
    while let Some(id) = queue.pop_front() {
        if let Some(node) = by_id.get(&id) {
            queue.push_back(node.left);
            if !node.is_self_pair() {
                queue.push_back(node.right);
            }
        } else {
            leaves.push(id);
        }
    }
    leaves
}

fn distinct_leaves(count: usize, seed: u64) -> Vec<Hash> {
    (0..count)
        .map(|i| hash_bytes(&(seed ^ i as u64).to_be_bytes()))
        .collect()
}

fn target_in_cap(bytes: [u8; 32]) -> Hash {
    let mut bytes = bytes;
    bytes[0] &= 0x3f;
    if bytes == [0u8; 32] {
        bytes[31] = 1;
    }
    Hash(bytes)
}

// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================

proptest! {
    /// The tree has one leaf per input id and reproduces the input order.
    #[test]
    fn prop_merkle_decomposition_reproduces_leaves(
        count in 1usize..64,
        seed in any::<u64>(),
    ) {
        let leaves = distinct_leaves(count, seed);
        let tree = merkle_from_tx_ids(&leaves).unwrap();
        prop_assert_eq!(decompose(&tree), leaves);
    }

    /// Node count stays within the 20/9 bound of the leaf count.
    #[test]
    fn prop_merkle_node_count_bounded(
        count in 1usize..256,
        seed in any::<u64>(),
    ) {
        let leaves = distinct_leaves(count, seed);
        let tree = merkle_from_tx_ids(&leaves).unwrap();
        prop_assert!(tree.nodes.len() <= count * 20 / 9);
    }

    /// The retargeted value stays inside the clamp window and the cap.
    #[test]
    fn prop_retarget_bounded(
        prev_bytes in any::<[u8; 32]>(),
        actual in any::<u64>(),
        desired in 1u64..u64::MAX,
    ) {
        let prev = target_in_cap(prev_bytes);
        let max = Hash::from_u256((U256::one() << 254) - 1);
        let next = retarget(&prev, actual, desired, &max).to_u256();

        let prev_value = prev.to_u256();
        prop_assert!(next >= prev_value / 4);
        prop_assert!(next <= prev_value.checked_mul(U256::from(4u64)).unwrap_or(U256::MAX));
        prop_assert!(next <= max.to_u256());
        prop_assert!(!next.is_zero());
    }

    /// Hash ordering is exactly big-endian integer ordering.
    #[test]
    fn prop_hash_order_matches_integer_order(
        a in any::<[u8; 32]>(),
        b in any::<[u8; 32]>(),
    ) {
        let (ha, hb) = (Hash(a), Hash(b));
        prop_assert_eq!(ha < hb, ha.to_u256() < hb.to_u256());
    }

    /// Block canonical encoding round-trips.
    #[test]
    fn prop_block_encode_roundtrip(
        prev in any::<[u8; 32]>(),
        root in any::<[u8; 32]>(),
        target in any::<[u8; 32]>(),
        noise in any::<[u8; 32]>(),
        nonce in any::<u64>(),
        mined_time in any::<u64>(),
    ) {
        let block = Block {
            prev_id: Hash(prev),
            merkle_root: Hash(root),
            target: Hash(target),
            noise: Hash(noise),
            nonce,
            mined_time,
        };
        let decoded = Block::decode_exact(&block.encode()).unwrap();
        prop_assert_eq!(decoded, block);
    }

    /// Block records round-trip through the textual format.
    #[test]
    fn prop_block_record_roundtrip(
        prev in any::<[u8; 32]>(),
        root in any::<[u8; 32]>(),
        target in any::<[u8; 32]>(),
        noise in any::<[u8; 32]>(),
        nonce in any::<u64>(),
        mined_time in any::<u64>(),
        height in any::<u64>(),
        work in any::<[u8; 32]>(),
    ) {
        let rec = StoredBlock {
            block: Block {
                prev_id: Hash(prev),
                merkle_root: Hash(root),
                target: Hash(target),
                noise: Hash(noise),
                nonce,
                mined_time,
            },
            height,
            total_work: U256::from_big_endian(&work),
        };
        let parsed = parse_block_record(&format_block_record(&rec)).unwrap();
        prop_assert_eq!(parsed, rec);
    }

    /// Merkle records round-trip through the textual format.
    #[test]
    fn prop_merkle_record_roundtrip(
        left in any::<[u8; 32]>(),
        right in any::<[u8; 32]>(),
        vsize in any::<u64>(),
    ) {
        let rec = StoredMerkle {
            node: MerkleNode::new(Hash(left), Hash(right)),
            vsize,
        };
        let parsed = parse_merkle_record(&format_merkle_record(&rec)).unwrap();
        prop_assert_eq!(parsed, rec);
    }

    /// Transaction records round-trip, keys and signatures included.
    #[test]
    fn prop_tx_record_roundtrip(
        is_coinbase in any::<bool>(),
        min_block in any::<u64>(),
        inputs in prop::collection::vec(
            (any::<[u8; 32]>(), any::<u64>(), any::<u64>(),
             prop::collection::vec(any::<u8>(), 33),
             prop::collection::vec(any::<u8>(), 64)),
            0..4,
        ),
        outputs in prop::collection::vec((any::<u64>(), any::<[u8; 32]>()), 0..4),
    ) {
        let tx = Tx {
            is_coinbase,
            min_block,
            inputs: inputs
                .into_iter()
                .map(|(tx_id, index, value, key, sig)| TxIn {
                    utxo: Utxo { tx_id: Hash(tx_id), index, value },
                    public_key: PublicKey(key.try_into().unwrap()),
                    signature: EcdsaSignature(sig.try_into().unwrap()),
                })
                .collect(),
            outputs: outputs
                .into_iter()
                .map(|(value, pkh)| TxOut { value, pubkey_hash: Hash(pkh) })
                .collect(),
        };
        let rec = StoredTx { vsize: tx.vsize(), tx };
        let parsed = parse_tx_record(&format_tx_record(&rec)).unwrap();
        prop_assert_eq!(parsed.tx.id(), rec.tx.id());
        prop_assert_eq!(parsed, rec);
    }
}

// ============================================================================
// ADVERSARIAL TESTS
// ============================================================================

fn funded_state() -> (Params, Arc<Inventory>, ChainState, PrivateKey, Hash) {
    let params = Params::development();
    let inv = Arc::new(Inventory::new(params.clone()));
    let mut state = ChainState::new(inv.clone(), false);
    let key = PrivateKey::generate();
    let miner = key.public_key().key_hash();
    let block =
        mining::mine_empty_block(&params, &inv, &Hash::zero(), 1_700_000_000, &miner).unwrap();
    let id = inv.store_block(block).unwrap();
    state.advance(&id).unwrap();
    let coinbase_id = inv
        .merkle_tx_ids(&inv.block(&id).unwrap().block.merkle_root)
        .unwrap()[0];
    (params, inv, state, key, coinbase_id)
}

fn spend_coinbase(params: &Params, key: &PrivateKey, coinbase_id: Hash, fee: u64, tag: &[u8]) -> Tx {
    let outputs = vec![TxOut {
        value: params.block_reward - fee,
        pubkey_hash: hash_bytes(tag),
    }];
    let digest = sig_hash(0, &outputs);
    Tx {
        is_coinbase: false,
        min_block: 0,
        inputs: vec![signed_input(
            Utxo {
                tx_id: coinbase_id,
                index: 0,
                value: params.block_reward,
            },
            key,
            &digest,
        )],
        outputs,
    }
}

/// A second transaction claiming an already-consumed output must fail.
#[test]
fn test_double_spend_rejected_on_advance() {
    let (params, inv, mut state, key, coinbase_id) = funded_state();

    let first = spend_coinbase(&params, &key, coinbase_id, 100, b"first");
    let second = spend_coinbase(&params, &key, coinbase_id, 200, b"second");
    let first_id = inv.store_tx(first).unwrap();
    let second_id = inv.store_tx(second).unwrap();
    state.add_mempool_tx(&first_id).unwrap();
    state.add_mempool_tx(&second_id).unwrap();

    // Include the first spend in a block.
    let target = mining::build_mining_target(&params, &inv, &state).unwrap();
    assert!(target.tx_ids.contains(&second_id)); // higher fee rate wins
    let payout = PrivateKey::generate().public_key().key_hash();
    let mut template = mining::BlockTemplate::build(&params, &inv, &target, &payout).unwrap();
    template.block.mined_time = 1_700_000_010;
    while !template.block.meets_target() {
        template.block.nonce += 1;
    }
    inv.store_tx(template.coinbase.clone()).ok();
    for node in &template.merkle.nodes {
        inv.store_merkle(*node).ok();
    }
    let block_id = inv.store_block(template.block).unwrap();
    state.advance(&block_id).unwrap();

    // The losing spend now references a consumed output.
    assert!(state.verify_tx_includable(&first_id).is_err());
    assert!(!state.sorted_includable_mempool().contains(&first_id));
}

/// Advancing then rewinding restores head, mempool and UTXO set exactly.
#[test]
fn test_advance_rewind_restores_state() {
    let (params, inv, mut state, key, coinbase_id) = funded_state();
    let spend = spend_coinbase(&params, &key, coinbase_id, 50, b"spend");
    let spend_id = inv.store_tx(spend).unwrap();
    state.add_mempool_tx(&spend_id).unwrap();

    let head_before = state.head();
    let utxos_before = state.utxo_set().clone();
    let mempool_before = state.mempool().clone();

    let target = mining::build_mining_target(&params, &inv, &state).unwrap();
    let payout = PrivateKey::generate().public_key().key_hash();
    let mut template = mining::BlockTemplate::build(&params, &inv, &target, &payout).unwrap();
    template.block.mined_time = 1_700_000_010;
    while !template.block.meets_target() {
        template.block.nonce += 1;
    }
    inv.store_tx(template.coinbase.clone()).ok();
    for node in &template.merkle.nodes {
        inv.store_merkle(*node).ok();
    }
    let block_id = inv.store_block(template.block).unwrap();

    state.advance(&block_id).unwrap();
    assert!(state.mempool().is_empty());
    state.rewind();

    assert_eq!(state.head(), head_before);
    assert_eq!(state.utxo_set(), &utxos_before);
    assert_eq!(state.mempool(), &mempool_before);
}
