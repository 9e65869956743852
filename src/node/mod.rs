//! Node orchestration
//!
//! Owns the live chain state and drives the candidate pipeline: store
//! incoming entities in the inventory, compare total work, and adopt a
//! better head by rewinding a clone of the state to the common ancestor
//! and advancing it along the new chain. The live state is swapped only
//! after the whole walk succeeded, so a failed candidate can never leave
//! observable corruption.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::crypto::Hash;
use crate::events::{CandidateHead, EventBus};
use crate::mining::build_mining_target;
use crate::params::Params;
use crate::storage::{ChainState, Inventory, InventoryError, StateError};
use crate::validation::{Tx, Utxo};

/// Candidate pipeline errors.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("candidate head {0} is unknown after storing its entities")]
    MissingCandidate(Hash),
}

/// The consensus engine around one live chain state.
pub struct Node {
    params: Params,
    inv: Arc<Inventory>,
    state: ChainState,
    bus: EventBus,
}

impl Node {
    pub fn new(params: Params, inv: Arc<Inventory>, bus: EventBus, track_balances: bool) -> Self {
        let state = ChainState::new(inv.clone(), track_balances);
        Self {
            params,
            inv,
            state,
            bus,
        }
    }

    pub fn inventory(&self) -> &Arc<Inventory> {
        &self.inv
    }

    pub fn state(&self) -> &ChainState {
        &self.state
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Store a candidate's entities and adopt its head if it carries more
    /// work than the current chain. Returns whether the head moved.
    pub fn handle_candidate_head(&mut self, candidate: CandidateHead) -> Result<bool, NodeError> {
        for tx in candidate.txs {
            match self.inv.store_tx(tx) {
                Ok(_) | Err(InventoryError::AlreadyKnown) => {}
                Err(err) => return Err(err.into()),
            }
        }
        for node in candidate.merkles {
            match self.inv.store_merkle(node) {
                Ok(_) | Err(InventoryError::AlreadyKnown) => {}
                Err(err) => return Err(err.into()),
            }
        }
        for block in candidate.blocks {
            match self.inv.store_block(block) {
                Ok(_) | Err(InventoryError::AlreadyKnown) => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.try_adopt(&candidate.head)
    }

    /// Verify, store and admit a transaction to the mempool.
    pub fn handle_candidate_tx(&mut self, tx: Tx) -> Result<(), NodeError> {
        if tx.is_coinbase {
            // Coinbases only make sense inside blocks.
            debug!(id = %tx.id(), "ignoring bare coinbase submission");
            return Ok(());
        }
        let id = tx.id();
        match self.inv.store_tx(tx) {
            Ok(_) | Err(InventoryError::AlreadyKnown) => {}
            Err(err) => return Err(err.into()),
        }
        self.state.add_mempool_tx(&id)?;
        info!(%id, "transaction admitted to mempool");
        self.bus.publish_validated_tx(id);
        self.publish_mining_target();
        Ok(())
    }

    /// Adopt the best block already in the inventory, used at startup
    /// after a restore.
    pub fn rebuild_from_inventory(&mut self) -> Result<(), NodeError> {
        if let Some(best) = self.inv.best_block() {
            self.try_adopt(&best)?;
        }
        Ok(())
    }

    /// Reorganize onto `new_head` if it carries strictly more work.
    fn try_adopt(&mut self, new_head: &Hash) -> Result<bool, NodeError> {
        let rec = self
            .inv
            .block(new_head)
            .ok_or(NodeError::MissingCandidate(*new_head))?;
        if rec.total_work <= self.state.total_work() {
            debug!(candidate = %new_head, "candidate does not carry more work");
            return Ok(false);
        }

        let lca = if self.state.head().is_zero() {
            Hash::zero()
        } else {
            self.inv.lca(&self.state.head(), new_head)?
        };

        // Work on a clone; the live state is replaced only on full success.
        let mut next = self.state.clone();
        next.rewind_until(&lca)?;
        let depth = self.inv.ancestor_depth(new_head, &lca)?;
        let mut path = self.inv.block_ancestors(new_head, depth.saturating_sub(1) as usize);
        path.reverse();
        path.push(*new_head);
        for id in &path {
            next.advance(id)?;
        }

        let reorged = lca != self.state.head();
        self.state = next;
        info!(
            head = %new_head,
            height = rec.height,
            reorg = reorged,
            "adopted new chain head"
        );
        self.bus.publish_validated_head(*new_head);
        self.publish_mining_target();
        Ok(true)
    }

    /// Recompute and announce what the miner should work on.
    pub fn publish_mining_target(&self) {
        match build_mining_target(&self.params, &self.inv, &self.state) {
            Some(target) => self.bus.publish_mining_target(target),
            None => warn!("could not derive a mining target for the current head"),
        }
    }

    /// Total unspent value owned by a public key hash.
    pub fn balance(&self, pubkey_hash: &Hash) -> u64 {
        self.state.balance(pubkey_hash)
    }

    /// Unspent outputs owned by a public key hash.
    pub fn utxos_for(&self, pubkey_hash: &Hash) -> Vec<Utxo> {
        self.state.utxos_for(pubkey_hash)
    }

    /// Which block finalized a transaction, if any.
    pub fn confirmation(&self, tx_id: &Hash) -> Option<Hash> {
        self.state.confirmation(tx_id)
    }

    /// Consume candidate events until every publisher is gone.
    pub async fn run(mut self) {
        let mut heads = self.bus.subscribe_candidate_heads();
        let mut txs = self.bus.subscribe_candidate_txs();
        self.publish_mining_target();

        loop {
            tokio::select! {
                result = heads.recv() => match result {
                    Ok(candidate) => {
                        let head = candidate.head;
                        if let Err(err) = self.handle_candidate_head(candidate) {
                            warn!(%head, %err, "rejected candidate head");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "candidate head channel lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
                result = txs.recv() => match result {
                    Ok(candidate) => {
                        let id = candidate.tx.id();
                        if let Err(err) = self.handle_candidate_tx(candidate.tx) {
                            warn!(%id, %err, "rejected candidate transaction");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "candidate tx channel lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PrivateKey;
    use crate::mining;
    use crate::params::Params;

    fn setup() -> (Params, Arc<Inventory>, Node) {
        let params = Params::development();
        let inv = Arc::new(Inventory::new(params.clone()));
        let node = Node::new(params.clone(), inv.clone(), EventBus::new(), true);
        (params, inv, node)
    }

    fn mined_candidate(
        params: &Params,
        inv: &Inventory,
        prev: &Hash,
        time: u64,
        payout: &Hash,
    ) -> CandidateHead {
        let block = mining::mine_empty_block(params, inv, prev, time, payout).unwrap();
        let rec_root = inv.merkle(&block.merkle_root).unwrap();
        let coinbase_id = inv.merkle_tx_ids(&block.merkle_root).unwrap()[0];
        CandidateHead {
            head: block.id(),
            blocks: vec![block],
            merkles: vec![rec_root.node],
            txs: vec![inv.tx(&coinbase_id).unwrap().tx],
        }
    }

    #[test]
    fn test_adopts_first_block() {
        let (params, inv, mut node) = setup();
        let miner = PrivateKey::generate().public_key().key_hash();
        let candidate = mined_candidate(&params, &inv, &Hash::zero(), 1_700_000_000, &miner);
        let head = candidate.head;

        assert!(node.handle_candidate_head(candidate).unwrap());
        assert_eq!(node.state().head(), head);
        assert_eq!(node.balance(&miner), params.block_reward);
    }

    #[test]
    fn test_lower_work_candidate_ignored() {
        let (params, inv, mut node) = setup();
        let miner = PrivateKey::generate().public_key().key_hash();

        let first = mined_candidate(&params, &inv, &Hash::zero(), 1_700_000_000, &miner);
        let head1 = first.head;
        node.handle_candidate_head(first).unwrap();
        let second = mined_candidate(&params, &inv, &head1, 1_700_000_010, &miner);
        node.handle_candidate_head(second).unwrap();

        // A fresh one-block fork carries less work than the two-block chain.
        let fork = mined_candidate(&params, &inv, &Hash::zero(), 1_700_000_001, &miner);
        assert!(!node.handle_candidate_head(fork).unwrap());
        assert_eq!(node.state().head_height(), 2);
    }

    #[test]
    fn test_reorg_to_longer_fork() {
        let (params, inv, mut node) = setup();
        let miner_a = PrivateKey::generate().public_key().key_hash();
        let miner_b = PrivateKey::generate().public_key().key_hash();

        let base = mined_candidate(&params, &inv, &Hash::zero(), 1_700_000_000, &miner_a);
        let base_id = base.head;
        node.handle_candidate_head(base).unwrap();

        let a1 = mined_candidate(&params, &inv, &base_id, 1_700_000_010, &miner_a);
        node.handle_candidate_head(a1).unwrap();
        assert_eq!(node.state().head_height(), 2);
        assert_eq!(node.balance(&miner_a), 2 * params.block_reward);

        // A competing fork from the base grows longer.
        let b1 = mined_candidate(&params, &inv, &base_id, 1_700_000_011, &miner_b);
        let b1_id = b1.head;
        node.handle_candidate_head(b1).unwrap();
        let b2 = mined_candidate(&params, &inv, &b1_id, 1_700_000_021, &miner_b);
        let b2_id = b2.head;
        assert!(node.handle_candidate_head(b2).unwrap());

        assert_eq!(node.state().head(), b2_id);
        assert_eq!(node.state().head_height(), 3);
        assert_eq!(node.balance(&miner_a), params.block_reward);
        assert_eq!(node.balance(&miner_b), 2 * params.block_reward);
    }

    #[test]
    fn test_rebuild_from_inventory() {
        let (params, inv, mut node) = setup();
        let miner = PrivateKey::generate().public_key().key_hash();
        let b1 = mining::mine_empty_block(&params, &inv, &Hash::zero(), 1_700_000_000, &miner)
            .unwrap();
        let b1_id = inv.store_block(b1).unwrap();
        let b2 = mining::mine_empty_block(&params, &inv, &b1_id, 1_700_000_010, &miner).unwrap();
        let b2_id = inv.store_block(b2).unwrap();

        node.rebuild_from_inventory().unwrap();
        assert_eq!(node.state().head(), b2_id);
    }

    #[test]
    fn test_candidate_tx_enters_mempool() {
        let (params, inv, mut node) = setup();
        let key = PrivateKey::generate();
        let miner = key.public_key().key_hash();
        let candidate = mined_candidate(&params, &inv, &Hash::zero(), 1_700_000_000, &miner);
        node.handle_candidate_head(candidate).unwrap();

        let coinbase_id = inv
            .merkle_tx_ids(&inv.block(&node.state().head()).unwrap().block.merkle_root)
            .unwrap()[0];
        let outputs = vec![crate::validation::TxOut {
            value: params.block_reward - 77,
            pubkey_hash: miner,
        }];
        let digest = crate::validation::sig_hash(0, &outputs);
        let tx = Tx {
            is_coinbase: false,
            min_block: 0,
            inputs: vec![crate::validation::signed_input(
                Utxo {
                    tx_id: coinbase_id,
                    index: 0,
                    value: params.block_reward,
                },
                &key,
                &digest,
            )],
            outputs,
        };
        let id = tx.id();
        node.handle_candidate_tx(tx).unwrap();
        assert!(node.state().in_mempool(&id));
        assert_eq!(node.confirmation(&id), None);
    }
}
