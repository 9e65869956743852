//! Consensus validation rules
//!
//! Pure rule checkers over `(Params, Inventory)`. Isolated rules look only
//! at the entity itself; contextual rules resolve referenced entities
//! through the inventory. None of these touch the UTXO set: spendability
//! is the chain state's concern.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::consensus::{next_target, Block};
use crate::crypto::{Hash, MerkleNode};
use crate::params::Params;
use crate::storage::Inventory;
use crate::validation::Tx;

/// How far into the future a mined timestamp may claim to be.
const MAX_CLOCK_DRIFT_SECS: u64 = 3600;

/// Number of ancestors contributing to the median time check.
const MEDIAN_TIME_SPAN: usize = 5;

/// Validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("transaction size {got} exceeds limit {limit}")]
    TxTooLarge { got: u64, limit: u64 },
    #[error("signature of input {index} does not verify")]
    BadSignature { index: usize },
    #[error("coinbase must have no inputs and exactly one output")]
    CoinbaseShape,
    #[error("coinbase value {got} is below the block reward {reward}")]
    CoinbaseValue { got: u64, reward: u64 },
    #[error("inputs ({inputs}) do not exceed outputs ({outputs})")]
    NoSurplus { inputs: u64, outputs: u64 },
    #[error("input references unknown transaction {0}")]
    UnknownOrigin(Hash),
    #[error("input references missing output {index} of {tx_id}")]
    MissingOriginOutput { tx_id: Hash, index: u64 },
    #[error("input public key does not match the output owner")]
    OwnerMismatch,
    #[error("input claims value {claimed} but the origin output holds {actual}")]
    ValueMismatch { claimed: u64, actual: u64 },

    #[error("merkle child {0} is unknown")]
    UnknownChild(Hash),
    #[error("merkle descendants total {got} bytes, limit {limit}")]
    MerkleTooLarge { got: u64, limit: u64 },
    #[error("merkle children share descendant transactions")]
    OverlappingChildren,

    #[error("block hash does not beat its target")]
    TargetNotMet,
    #[error("unknown merkle root {0}")]
    UnknownMerkleRoot(Hash),
    #[error("unknown parent block {0}")]
    UnknownParent(Hash),
    #[error("block contains no transactions")]
    EmptyBlock,
    #[error("block has {got} transactions, theoretical limit {limit}")]
    TooManyTxs { got: u64, limit: u64 },
    #[error("first transaction must be a coinbase")]
    MissingCoinbase,
    #[error("coinbase min_block is {got}, expected {expected}")]
    CoinbaseHeight { got: u64, expected: u64 },
    #[error("transaction {0} is a second coinbase")]
    ExtraCoinbase(Hash),
    #[error("ledger imbalance: inputs {inputs} + reward {reward} != outputs {outputs}")]
    UnbalancedBlock {
        inputs: u128,
        reward: u64,
        outputs: u128,
    },
    #[error("block transactions total {got} bytes, limit {limit}")]
    BlockTooLarge { got: u64, limit: u64 },
    #[error("mined time {got} is not above the ancestor median {median}")]
    TimeBehindMedian { got: u64, median: u64 },
    #[error("mined time {0} is too far in the future")]
    TimeTooFar(u64),
    #[error("block target does not match the required difficulty")]
    WrongTarget,
    #[error("block references missing entity {0}")]
    MissingEntity(Hash),
}

/// Verify a transaction: isolated rules plus origin-output consistency
/// against transactions already in the inventory.
pub fn verify_tx(params: &Params, inv: &Inventory, tx: &Tx) -> Result<(), ValidationError> {
    let vsize = tx.vsize();
    if vsize > params.max_tx_vsize {
        return Err(ValidationError::TxTooLarge {
            got: vsize,
            limit: params.max_tx_vsize,
        });
    }

    let digest = tx.sig_hash();
    for (index, input) in tx.inputs.iter().enumerate() {
        if !input.public_key.verify(&digest, &input.signature) {
            return Err(ValidationError::BadSignature { index });
        }
    }

    if tx.is_coinbase {
        if !tx.inputs.is_empty() || tx.outputs.len() != 1 {
            return Err(ValidationError::CoinbaseShape);
        }
        if tx.outputs[0].value < params.block_reward {
            return Err(ValidationError::CoinbaseValue {
                got: tx.outputs[0].value,
                reward: params.block_reward,
            });
        }
    } else {
        let inputs = tx.total_input_value();
        let outputs = tx.total_output_value();
        if inputs <= outputs {
            return Err(ValidationError::NoSurplus { inputs, outputs });
        }
    }

    for input in &tx.inputs {
        let origin = inv
            .tx(&input.utxo.tx_id)
            .ok_or(ValidationError::UnknownOrigin(input.utxo.tx_id))?;
        let output = origin
            .tx
            .outputs
            .get(input.utxo.index as usize)
            .ok_or(ValidationError::MissingOriginOutput {
                tx_id: input.utxo.tx_id,
                index: input.utxo.index,
            })?;
        if output.pubkey_hash != input.public_key.key_hash() {
            return Err(ValidationError::OwnerMismatch);
        }
        if output.value != input.utxo.value {
            return Err(ValidationError::ValueMismatch {
                claimed: input.utxo.value,
                actual: output.value,
            });
        }
    }

    Ok(())
}

/// Verify a merkle node against its already-stored children and return the
/// deduplicated descendant byte size to cache.
pub fn verify_merkle(
    params: &Params,
    inv: &Inventory,
    node: &MerkleNode,
) -> Result<u64, ValidationError> {
    let left_size = inv
        .entity_vsize(&node.left)
        .ok_or(ValidationError::UnknownChild(node.left))?;

    let vsize = if node.is_self_pair() {
        left_size
    } else {
        let right_size = inv
            .entity_vsize(&node.right)
            .ok_or(ValidationError::UnknownChild(node.right))?;

        // A transaction must not be countable twice under one root.
        let left_txs = inv
            .descendant_tx_ids(&node.left)
            .ok_or(ValidationError::UnknownChild(node.left))?;
        let right_txs: HashSet<Hash> = inv
            .descendant_tx_ids(&node.right)
            .ok_or(ValidationError::UnknownChild(node.right))?
            .into_iter()
            .collect();
        if left_txs.iter().any(|id| right_txs.contains(id)) {
            return Err(ValidationError::OverlappingChildren);
        }

        left_size + right_size
    };

    if vsize > params.max_block_vsize {
        return Err(ValidationError::MerkleTooLarge {
            got: vsize,
            limit: params.max_block_vsize,
        });
    }

    Ok(vsize)
}

/// Verify a block against its already-stored contents and ancestry.
///
/// Rules run in a fixed order and fail fast with a distinct error each.
/// UTXO availability is deliberately not checked here.
pub fn verify_block(params: &Params, inv: &Inventory, block: &Block) -> Result<(), ValidationError> {
    if !block.meets_target() {
        return Err(ValidationError::TargetNotMet);
    }

    if !inv.has_merkle(&block.merkle_root) {
        return Err(ValidationError::UnknownMerkleRoot(block.merkle_root));
    }
    let parent_height = if block.is_genesis() {
        0
    } else {
        inv.block(&block.prev_id)
            .ok_or(ValidationError::UnknownParent(block.prev_id))?
            .height
    };
    let new_height = parent_height + 1;

    let tx_ids = inv
        .merkle_tx_ids(&block.merkle_root)
        .ok_or(ValidationError::MissingEntity(block.merkle_root))?;
    if tx_ids.is_empty() {
        return Err(ValidationError::EmptyBlock);
    }
    let limit = params.max_block_tx_count();
    if tx_ids.len() as u64 > limit {
        return Err(ValidationError::TooManyTxs {
            got: tx_ids.len() as u64,
            limit,
        });
    }

    let mut txs = Vec::with_capacity(tx_ids.len());
    for id in &tx_ids {
        txs.push(inv.tx(id).ok_or(ValidationError::MissingEntity(*id))?);
    }

    let first = &txs[0];
    if !first.tx.is_coinbase {
        return Err(ValidationError::MissingCoinbase);
    }
    if first.tx.min_block != new_height {
        return Err(ValidationError::CoinbaseHeight {
            got: first.tx.min_block,
            expected: new_height,
        });
    }
    for (id, stored) in tx_ids.iter().zip(&txs).skip(1) {
        if stored.tx.is_coinbase {
            return Err(ValidationError::ExtraCoinbase(*id));
        }
    }

    let inputs: u128 = txs
        .iter()
        .map(|stored| stored.tx.total_input_value() as u128)
        .sum();
    let outputs: u128 = txs
        .iter()
        .map(|stored| stored.tx.total_output_value() as u128)
        .sum();
    if inputs + params.block_reward as u128 != outputs {
        return Err(ValidationError::UnbalancedBlock {
            inputs,
            reward: params.block_reward,
            outputs,
        });
    }

    let total_vsize: u64 = txs.iter().map(|stored| stored.vsize).sum();
    if total_vsize > params.max_block_vsize {
        return Err(ValidationError::BlockTooLarge {
            got: total_vsize,
            limit: params.max_block_vsize,
        });
    }

    if !block.is_genesis() {
        let mut times = vec![];
        if let Some(parent) = inv.block(&block.prev_id) {
            times.push(parent.block.mined_time);
        }
        for ancestor in inv.block_ancestors(&block.prev_id, MEDIAN_TIME_SPAN - 1) {
            if let Some(rec) = inv.block(&ancestor) {
                times.push(rec.block.mined_time);
            }
        }
        if !times.is_empty() {
            times.sort_unstable();
            let median = times[times.len() / 2];
            if block.mined_time <= median {
                return Err(ValidationError::TimeBehindMedian {
                    got: block.mined_time,
                    median,
                });
            }
        }
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    if block.mined_time >= now + MAX_CLOCK_DRIFT_SECS {
        return Err(ValidationError::TimeTooFar(block.mined_time));
    }

    let expected = next_target(params, inv, &block.prev_id)
        .ok_or(ValidationError::UnknownParent(block.prev_id))?;
    if block.target != expected {
        return Err(ValidationError::WrongTarget);
    }

    Ok(())
}
