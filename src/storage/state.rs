//! Chain state management
//!
//! The ledger as seen from one specific head: UTXO set, mempool, and the
//! record of which block finalized each transaction. A chain state has
//! exactly one logical owner; a failed `advance` may leave the struct
//! inconsistent, so reorganizations clone the state, mutate the clone and
//! swap it in only on full success.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::crypto::Hash;
use crate::storage::{Inventory, UtxoSet};
use crate::validation::{Tx, Utxo};
use crate::U256;
use std::sync::Arc;

/// Chain state errors. These abort a state transition; the mutated copy
/// must be discarded.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("block {0} is unknown")]
    UnknownBlock(Hash),
    #[error("block {block} does not extend the current head {head}")]
    NotOnHead { block: Hash, head: Hash },
    #[error("transaction {0} is unknown")]
    UnknownTx(Hash),
    #[error("transaction {tx} is not valid before block {min_block}")]
    NotYetValid { tx: Hash, min_block: u64 },
    #[error("transaction {0} is not in the mempool")]
    NotInMempool(Hash),
    #[error("output {tx_id}:{index} is spent or unknown")]
    UtxoUnavailable { tx_id: Hash, index: u64 },
    #[error("contents of block {0} cannot be resolved")]
    CorruptBlock(Hash),
    #[error("{target} is not an ancestor of the current head")]
    NotAnAncestor { target: Hash },
}

/// The ledger at one specific chain head.
#[derive(Clone)]
pub struct ChainState {
    inv: Arc<Inventory>,
    head: Hash,
    utxos: UtxoSet,
    /// Pending transaction ids with their cached fee rate.
    mempool: HashMap<Hash, f64>,
    /// Which block finalized each included transaction.
    included: HashMap<Hash, Hash>,
    /// Optional owner index for balance queries.
    pkh_utxos: Option<HashMap<Hash, HashSet<Utxo>>>,
}

impl ChainState {
    /// Create an empty state at the zero sentinel.
    ///
    /// `track_balances` enables the per-owner UTXO index; balance queries
    /// on a state built without it are a programming error and abort.
    pub fn new(inv: Arc<Inventory>, track_balances: bool) -> Self {
        Self {
            inv,
            head: Hash::zero(),
            utxos: UtxoSet::new(),
            mempool: HashMap::new(),
            included: HashMap::new(),
            pkh_utxos: track_balances.then(HashMap::new),
        }
    }

    pub fn head(&self) -> Hash {
        self.head
    }

    /// Height of the current head.
    pub fn head_height(&self) -> u64 {
        if self.head.is_zero() {
            return 0;
        }
        self.inv
            .block(&self.head)
            .expect("chain head missing from inventory")
            .height
    }

    /// Total work of the current head's chain.
    pub fn total_work(&self) -> U256 {
        self.inv
            .total_work(&self.head)
            .expect("chain head missing from inventory")
    }

    pub fn utxo_set(&self) -> &UtxoSet {
        &self.utxos
    }

    pub fn mempool(&self) -> &HashMap<Hash, f64> {
        &self.mempool
    }

    /// Apply the block `next` on top of the current head.
    ///
    /// Consumes every input of every contained transaction in block order,
    /// produces the new outputs, drops included transactions from the
    /// mempool and records where each was finalized. On error the struct
    /// may be partially mutated; operate on a clone and discard it.
    pub fn advance(&mut self, next: &Hash) -> Result<(), StateError> {
        let rec = self
            .inv
            .block(next)
            .ok_or(StateError::UnknownBlock(*next))?;
        if rec.block.prev_id != self.head {
            return Err(StateError::NotOnHead {
                block: *next,
                head: self.head,
            });
        }
        let new_height = rec.height;
        let tx_ids = self
            .inv
            .merkle_tx_ids(&rec.block.merkle_root)
            .ok_or(StateError::CorruptBlock(*next))?;

        for tx_id in &tx_ids {
            let stored = self.inv.tx(tx_id).ok_or(StateError::UnknownTx(*tx_id))?;
            let tx = stored.tx;
            if tx.min_block > new_height {
                return Err(StateError::NotYetValid {
                    tx: *tx_id,
                    min_block: tx.min_block,
                });
            }

            for input in &tx.inputs {
                self.utxos
                    .remove(&input.utxo.tx_id, input.utxo.index)
                    .ok_or(StateError::UtxoUnavailable {
                        tx_id: input.utxo.tx_id,
                        index: input.utxo.index,
                    })?;
                if self.pkh_utxos.is_some() {
                    let owner = self.output_owner(&input.utxo);
                    self.unindex_utxo(&owner, &input.utxo);
                }
            }

            for (index, output) in tx.outputs.iter().enumerate() {
                let utxo = Utxo {
                    tx_id: *tx_id,
                    index: index as u64,
                    value: output.value,
                };
                self.utxos.add(utxo);
                if let Some(index_map) = &mut self.pkh_utxos {
                    index_map
                        .entry(output.pubkey_hash)
                        .or_default()
                        .insert(utxo);
                }
            }

            self.mempool.remove(tx_id);
            self.included.insert(*tx_id, *next);
        }

        self.head = *next;
        Ok(())
    }

    /// Undo the current head's block, the exact inverse of [`advance`].
    ///
    /// Any violated expectation here means the append-only or
    /// copy-on-reorg discipline was broken elsewhere, so this aborts
    /// rather than returning a recoverable error.
    ///
    /// [`advance`]: ChainState::advance
    pub fn rewind(&mut self) {
        assert!(!self.head.is_zero(), "rewind past the zero sentinel");
        let rec = self
            .inv
            .block(&self.head)
            .expect("chain head missing from inventory");
        let tx_ids = self
            .inv
            .merkle_tx_ids(&rec.block.merkle_root)
            .expect("head block contents missing from inventory");

        for tx_id in tx_ids.iter().rev() {
            let stored = self
                .inv
                .tx(tx_id)
                .expect("included transaction missing from inventory");
            let tx = &stored.tx;

            for (index, output) in tx.outputs.iter().enumerate() {
                let removed = self.utxos.remove(tx_id, index as u64);
                assert!(removed.is_some(), "produced output missing during rewind");
                if self.pkh_utxos.is_some() {
                    let utxo = Utxo {
                        tx_id: *tx_id,
                        index: index as u64,
                        value: output.value,
                    };
                    self.unindex_utxo(&output.pubkey_hash, &utxo);
                }
            }

            for input in &tx.inputs {
                self.utxos.add(input.utxo);
                if self.pkh_utxos.is_some() {
                    let owner = self.output_owner(&input.utxo);
                    self.index_utxo(&owner, &input.utxo);
                }
            }

            let finalized = self.included.remove(tx_id);
            assert!(finalized.is_some(), "included record missing during rewind");
            if !tx.is_coinbase {
                self.mempool.insert(*tx_id, fee_rate(tx, stored.vsize));
            }
        }

        self.head = rec.block.prev_id;
    }

    /// Rewind until `target` is the head.
    pub fn rewind_until(&mut self, target: &Hash) -> Result<(), StateError> {
        let depth = self
            .inv
            .ancestor_depth(&self.head, target)
            .map_err(|_| StateError::NotAnAncestor { target: *target })?;
        for _ in 0..depth {
            self.rewind();
        }
        assert_eq!(self.head, *target, "rewind did not reach the target block");
        Ok(())
    }

    /// Admit a stored transaction to the mempool, caching its fee rate.
    pub fn add_mempool_tx(&mut self, tx_id: &Hash) -> Result<(), StateError> {
        let stored = self.inv.tx(tx_id).ok_or(StateError::UnknownTx(*tx_id))?;
        self.mempool
            .insert(*tx_id, fee_rate(&stored.tx, stored.vsize));
        Ok(())
    }

    pub fn in_mempool(&self, tx_id: &Hash) -> bool {
        self.mempool.contains_key(tx_id)
    }

    /// Check that a mempool transaction could be included in the next
    /// block: known, height bound satisfied, mempool-resident, and every
    /// consumed output currently unspent.
    pub fn verify_tx_includable(&self, tx_id: &Hash) -> Result<(), StateError> {
        let stored = self.inv.tx(tx_id).ok_or(StateError::UnknownTx(*tx_id))?;
        if stored.tx.min_block > self.head_height() + 1 {
            return Err(StateError::NotYetValid {
                tx: *tx_id,
                min_block: stored.tx.min_block,
            });
        }
        if !self.mempool.contains_key(tx_id) {
            return Err(StateError::NotInMempool(*tx_id));
        }
        for input in &stored.tx.inputs {
            if !self.utxos.contains(&input.utxo.tx_id, input.utxo.index) {
                return Err(StateError::UtxoUnavailable {
                    tx_id: input.utxo.tx_id,
                    index: input.utxo.index,
                });
            }
        }
        Ok(())
    }

    /// Mempool transactions that are currently includable and carry a
    /// strictly positive surplus, best fee rate first. Tie order between
    /// equal rates is unspecified.
    pub fn sorted_includable_mempool(&self) -> Vec<Hash> {
        let mut entries: Vec<(Hash, f64)> = self
            .mempool
            .iter()
            .filter(|(tx_id, _)| {
                if self.verify_tx_includable(tx_id).is_err() {
                    return false;
                }
                match self.inv.tx(tx_id) {
                    Some(stored) => {
                        stored.tx.total_input_value() > stored.tx.total_output_value()
                    }
                    None => false,
                }
            })
            .map(|(tx_id, rate)| (*tx_id, *rate))
            .collect();
        entries.sort_unstable_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        entries.into_iter().map(|(tx_id, _)| tx_id).collect()
    }

    /// Which block finalized a transaction, if any.
    pub fn confirmation(&self, tx_id: &Hash) -> Option<Hash> {
        self.included.get(tx_id).copied()
    }

    /// Total unspent value owned by a public key hash.
    ///
    /// Aborts if the state was built without balance tracking.
    pub fn balance(&self, pubkey_hash: &Hash) -> u64 {
        self.owner_index()
            .get(pubkey_hash)
            .map(|set| set.iter().map(|utxo| utxo.value).sum())
            .unwrap_or(0)
    }

    /// Unspent outputs owned by a public key hash.
    ///
    /// Aborts if the state was built without balance tracking.
    pub fn utxos_for(&self, pubkey_hash: &Hash) -> Vec<Utxo> {
        self.owner_index()
            .get(pubkey_hash)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    fn owner_index(&self) -> &HashMap<Hash, HashSet<Utxo>> {
        self.pkh_utxos
            .as_ref()
            .expect("balance tracking was not enabled for this chain state")
    }

    fn index_utxo(&mut self, owner: &Hash, utxo: &Utxo) {
        self.pkh_utxos
            .as_mut()
            .expect("balance tracking was not enabled for this chain state")
            .entry(*owner)
            .or_default()
            .insert(*utxo);
    }

    fn unindex_utxo(&mut self, owner: &Hash, utxo: &Utxo) {
        let index = self
            .pkh_utxos
            .as_mut()
            .expect("balance tracking was not enabled for this chain state");
        if let Some(set) = index.get_mut(owner) {
            set.remove(utxo);
            if set.is_empty() {
                index.remove(owner);
            }
        }
    }

    /// Owner of a spent output, resolved through the inventory.
    fn output_owner(&self, utxo: &Utxo) -> Hash {
        self.inv
            .tx(&utxo.tx_id)
            .expect("origin transaction missing from inventory")
            .tx
            .outputs[utxo.index as usize]
            .pubkey_hash
    }
}

/// Fee rate used to order the mempool.
fn fee_rate(tx: &Tx, vsize: u64) -> f64 {
    tx.fee() as f64 / vsize as f64
}
