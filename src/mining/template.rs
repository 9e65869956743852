//! Block template construction
//!
//! Candidate selection is greedy by descending fee rate under the block
//! size budget, excluding any transaction whose inputs collide with an
//! earlier selection. The template itself (coinbase, merkle tree, header)
//! is derived deterministically from a mining target, so the node and the
//! miner always reconstruct the same block for the same target.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::consensus::{next_target, Block};
use crate::crypto::{merkle_from_tx_ids, Hash, MerkleTree};
use crate::events::MiningTarget;
use crate::params::Params;
use crate::storage::{ChainState, Inventory, InventoryError};
use crate::validation::Tx;

/// Template construction errors.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unknown block {0}")]
    UnknownBlock(Hash),
    #[error("selected transaction {0} is unknown")]
    UnknownTx(Hash),
    #[error("no difficulty target derivable for parent {0}")]
    NoTarget(Hash),
    #[error(transparent)]
    Store(#[from] InventoryError),
}

/// A fully derived block ready for the nonce search.
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub block: Block,
    pub coinbase: Tx,
    pub merkle: MerkleTree,
}

/// Greedily select includable mempool transactions for the next block.
///
/// Transactions are taken best fee rate first, skipping any that would
/// blow the remaining budget or double-spend an output an earlier pick
/// already consumes. Selection stops once no minimal transaction could
/// fit.
pub fn select_mempool(params: &Params, inv: &Inventory, state: &ChainState) -> Vec<Hash> {
    let coinbase_probe = Tx::coinbase(0, 0, Hash::zero());
    let mut budget = params.max_block_vsize.saturating_sub(coinbase_probe.vsize());

    let mut claimed: HashSet<(Hash, u64)> = HashSet::new();
    let mut selected = Vec::new();
    for tx_id in state.sorted_includable_mempool() {
        if budget < Tx::MIN_VSIZE {
            break;
        }
        let Some(stored) = inv.tx(&tx_id) else { continue };
        if stored.vsize > budget {
            continue;
        }
        if stored
            .tx
            .inputs
            .iter()
            .any(|input| claimed.contains(&(input.utxo.tx_id, input.utxo.index)))
        {
            continue;
        }
        for input in &stored.tx.inputs {
            claimed.insert((input.utxo.tx_id, input.utxo.index));
        }
        budget -= stored.vsize;
        selected.push(tx_id);
    }
    selected
}

/// Build the mining target for the current head.
pub fn build_mining_target(
    params: &Params,
    inv: &Inventory,
    state: &ChainState,
) -> Option<MiningTarget> {
    let head = state.head();
    let target = next_target(params, inv, &head)?;
    Some(MiningTarget {
        head,
        target,
        tx_ids: select_mempool(params, inv, state),
    })
}

impl BlockTemplate {
    /// Re-derive the full template (coinbase, merkle tree, header) from a
    /// mining target.
    pub fn build(
        params: &Params,
        inv: &Inventory,
        target: &MiningTarget,
        payout: &Hash,
    ) -> Result<Self, TemplateError> {
        let head_height = if target.head.is_zero() {
            0
        } else {
            inv.block(&target.head)
                .ok_or(TemplateError::UnknownBlock(target.head))?
                .height
        };

        let mut fees: u64 = 0;
        for tx_id in &target.tx_ids {
            let stored = inv.tx(tx_id).ok_or(TemplateError::UnknownTx(*tx_id))?;
            fees = fees.saturating_add(stored.tx.fee());
        }

        let coinbase = Tx::coinbase(
            params.block_reward.saturating_add(fees),
            head_height + 1,
            *payout,
        );

        let mut leaf_ids = Vec::with_capacity(target.tx_ids.len() + 1);
        leaf_ids.push(coinbase.id());
        leaf_ids.extend_from_slice(&target.tx_ids);
        let merkle = merkle_from_tx_ids(&leaf_ids).expect("leaf list always has the coinbase");

        let block = Block {
            prev_id: target.head,
            merkle_root: merkle.root,
            target: target.target,
            noise: Hash(rand::random()),
            nonce: 0,
            mined_time: unix_time(),
        };

        Ok(Self {
            block,
            coinbase,
            merkle,
        })
    }

    /// Restart the search space with fresh entropy.
    pub fn reroll_noise(&mut self) {
        self.block.noise = Hash(rand::random());
        self.block.nonce = 0;
        self.block.mined_time = unix_time();
    }
}

/// Mine a coinbase-only block on `prev`, storing its coinbase and merkle
/// node in the inventory first so the result is immediately storable.
///
/// Grinds synchronously; only sensible against development-grade targets.
pub fn mine_empty_block(
    params: &Params,
    inv: &Inventory,
    prev: &Hash,
    mined_time: u64,
    payout: &Hash,
) -> Result<Block, TemplateError> {
    let head_height = if prev.is_zero() {
        0
    } else {
        inv.block(prev)
            .ok_or(TemplateError::UnknownBlock(*prev))?
            .height
    };
    let target = next_target(params, inv, prev).ok_or(TemplateError::NoTarget(*prev))?;

    let coinbase = Tx::coinbase(params.block_reward, head_height + 1, *payout);
    match inv.store_tx(coinbase.clone()) {
        Ok(_) | Err(InventoryError::AlreadyKnown) => {}
        Err(err) => return Err(err.into()),
    }
    let merkle = merkle_from_tx_ids(&[coinbase.id()]).expect("one leaf");
    for node in &merkle.nodes {
        match inv.store_merkle(*node) {
            Ok(_) | Err(InventoryError::AlreadyKnown) => {}
            Err(err) => return Err(err.into()),
        }
    }

    let mut block = Block {
        prev_id: *prev,
        merkle_root: merkle.root,
        target,
        noise: Hash(rand::random()),
        nonce: 0,
        mined_time,
    };
    while !block.meets_target() {
        if block.nonce == u64::MAX {
            block.noise = Hash(rand::random());
            block.nonce = 0;
        } else {
            block.nonce += 1;
        }
    }
    Ok(block)
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
