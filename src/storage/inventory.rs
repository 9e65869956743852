//! Content-addressed inventory
//!
//! Write-once, deduplicated storage of blocks, merkle nodes and
//! transactions, with derived metadata (height, total work, byte size) and
//! chain-ancestry queries. Entries are never mutated or deleted once
//! stored. The maps are the only resource written from multiple tasks, so
//! they are concurrent maps with store-if-absent semantics: verification
//! runs first, and an entry becomes visible only after it verified.

use std::collections::VecDeque;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

use crate::consensus::{verify_block, verify_merkle, verify_tx, work_for_target, Block};
use crate::consensus::ValidationError;
use crate::crypto::{Hash, MerkleNode};
use crate::params::Params;
use crate::storage::db::{DbError, RecordDb};
use crate::validation::Tx;
use crate::U256;

/// A block plus its derived chain metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredBlock {
    pub block: Block,
    /// Chain height; the zero sentinel counts as height 0.
    pub height: u64,
    /// Cumulative work of the chain ending at this block.
    pub total_work: U256,
}

/// A merkle node plus its cached descendant byte size.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMerkle {
    pub node: MerkleNode,
    pub vsize: u64,
}

/// A transaction plus its cached byte size.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTx {
    pub tx: Tx,
    pub vsize: u64,
}

/// Inventory errors.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("entity is already known")]
    AlreadyKnown,
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("unknown block {0}")]
    UnknownBlock(Hash),
    #[error("{ancestor} is not an ancestor of {descendant}")]
    NotAnAncestor { ancestor: Hash, descendant: Hash },
    #[error("persistence failure: {0}")]
    Persistence(#[from] DbError),
}

/// Durable, deduplicated, content-addressed storage.
pub struct Inventory {
    params: Params,
    blocks: DashMap<Hash, StoredBlock>,
    merkles: DashMap<Hash, StoredMerkle>,
    txs: DashMap<Hash, StoredTx>,
    db: Option<RecordDb>,
}

impl Inventory {
    /// Create an in-memory inventory.
    pub fn new(params: Params) -> Self {
        Self {
            params,
            blocks: DashMap::new(),
            merkles: DashMap::new(),
            txs: DashMap::new(),
            db: None,
        }
    }

    /// Create an inventory that persists every stored entity.
    pub fn with_db(params: Params, db: RecordDb) -> Self {
        Self {
            db: Some(db),
            ..Self::new(params)
        }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Verify and store a block, deriving its height and total work.
    ///
    /// UTXO availability is not checked here; that is the chain state's
    /// job when the block is advanced onto a head.
    pub fn store_block(&self, block: Block) -> Result<Hash, InventoryError> {
        let id = block.id();
        if self.blocks.contains_key(&id) {
            return Err(InventoryError::AlreadyKnown);
        }
        verify_block(&self.params, self, &block)?;

        let (parent_height, parent_work) = if block.is_genesis() {
            (0, U256::zero())
        } else {
            let parent = self
                .blocks
                .get(&block.prev_id)
                .ok_or(ValidationError::UnknownParent(block.prev_id))?;
            (parent.height, parent.total_work)
        };
        let stored = StoredBlock {
            height: parent_height + 1,
            total_work: parent_work.saturating_add(work_for_target(&block.target)),
            block,
        };

        match self.blocks.entry(id) {
            Entry::Occupied(_) => return Err(InventoryError::AlreadyKnown),
            Entry::Vacant(entry) => {
                entry.insert(stored.clone());
            }
        }
        if let Some(db) = &self.db {
            db.save_block(&id, &stored)?;
        }
        Ok(id)
    }

    /// Verify and store a merkle node, caching its descendant byte size.
    pub fn store_merkle(&self, node: MerkleNode) -> Result<Hash, InventoryError> {
        let id = node.id();
        if self.merkles.contains_key(&id) {
            return Err(InventoryError::AlreadyKnown);
        }
        let vsize = verify_merkle(&self.params, self, &node)?;
        let stored = StoredMerkle { node, vsize };

        match self.merkles.entry(id) {
            Entry::Occupied(_) => return Err(InventoryError::AlreadyKnown),
            Entry::Vacant(entry) => {
                entry.insert(stored.clone());
            }
        }
        if let Some(db) = &self.db {
            db.save_merkle(&id, &stored)?;
        }
        Ok(id)
    }

    /// Verify and store a transaction, caching its byte size.
    pub fn store_tx(&self, tx: Tx) -> Result<Hash, InventoryError> {
        let id = tx.id();
        if self.txs.contains_key(&id) {
            return Err(InventoryError::AlreadyKnown);
        }
        verify_tx(&self.params, self, &tx)?;
        let vsize = tx.vsize();
        let stored = StoredTx { tx, vsize };

        match self.txs.entry(id) {
            Entry::Occupied(_) => return Err(InventoryError::AlreadyKnown),
            Entry::Vacant(entry) => {
                entry.insert(stored.clone());
            }
        }
        if let Some(db) = &self.db {
            db.save_tx(&id, &stored)?;
        }
        Ok(id)
    }

    /// Re-insert persisted records without re-verification.
    ///
    /// Records were verified when first stored; re-inserting transactions
    /// before merkles before blocks keeps every lookup the loaded entities
    /// could make satisfiable regardless of on-disk iteration order.
    pub fn restore(&self) -> Result<(usize, usize, usize), InventoryError> {
        let Some(db) = &self.db else {
            return Ok((0, 0, 0));
        };
        let txs = db.load_txs()?;
        let tx_count = txs.len();
        for stored in txs {
            let id = stored.tx.id();
            self.txs.entry(id).or_insert(stored);
        }
        let merkles = db.load_merkles()?;
        let merkle_count = merkles.len();
        for stored in merkles {
            let id = stored.node.id();
            self.merkles.entry(id).or_insert(stored);
        }
        let blocks = db.load_blocks()?;
        let block_count = blocks.len();
        for stored in blocks {
            let id = stored.block.id();
            self.blocks.entry(id).or_insert(stored);
        }
        Ok((block_count, merkle_count, tx_count))
    }

    pub fn block(&self, id: &Hash) -> Option<StoredBlock> {
        self.blocks.get(id).map(|entry| entry.clone())
    }

    pub fn merkle(&self, id: &Hash) -> Option<StoredMerkle> {
        self.merkles.get(id).map(|entry| entry.clone())
    }

    pub fn tx(&self, id: &Hash) -> Option<StoredTx> {
        self.txs.get(id).map(|entry| entry.clone())
    }

    pub fn has_block(&self, id: &Hash) -> bool {
        self.blocks.contains_key(id)
    }

    pub fn has_merkle(&self, id: &Hash) -> bool {
        self.merkles.contains_key(id)
    }

    pub fn has_tx(&self, id: &Hash) -> bool {
        self.txs.contains_key(id)
    }

    /// Byte size of a transaction or merkle node, if known.
    pub fn entity_vsize(&self, id: &Hash) -> Option<u64> {
        if let Some(tx) = self.txs.get(id) {
            return Some(tx.vsize);
        }
        self.merkles.get(id).map(|m| m.vsize)
    }

    /// Transaction ids reachable from a transaction or merkle node.
    pub fn descendant_tx_ids(&self, id: &Hash) -> Option<Vec<Hash>> {
        if self.txs.contains_key(id) {
            return Some(vec![*id]);
        }
        if self.merkles.contains_key(id) {
            return self.merkle_tx_ids(id);
        }
        None
    }

    /// Ordered transaction ids under a merkle root.
    ///
    /// Breadth-first traversal distinguishing transaction leaves from
    /// internal nodes by existence. A self-paired child is visited once,
    /// so decomposition reproduces the original leaf sequence. Terminates
    /// because hash identity makes the tree acyclic.
    pub fn merkle_tx_ids(&self, root: &Hash) -> Option<Vec<Hash>> {
        let mut queue = VecDeque::from([*root]);
        let mut leaves = Vec::new();
        while let Some(id) = queue.pop_front() {
            if let Some(entry) = self.merkles.get(&id) {
                queue.push_back(entry.node.left);
                if !entry.node.is_self_pair() {
                    queue.push_back(entry.node.right);
                }
            } else if self.txs.contains_key(&id) {
                leaves.push(id);
            } else {
                return None;
            }
        }
        Some(leaves)
    }

    /// Ancestor ids of `id`, nearest first, exclusive of `id` itself.
    ///
    /// Walks parent pointers up to `max_len` hops or until the zero
    /// sentinel.
    pub fn block_ancestors(&self, id: &Hash, max_len: usize) -> Vec<Hash> {
        let mut out = Vec::new();
        let mut cursor = *id;
        while out.len() < max_len {
            let Some(rec) = self.block(&cursor) else { break };
            let parent = rec.block.prev_id;
            if parent.is_zero() {
                break;
            }
            out.push(parent);
            cursor = parent;
        }
        out
    }

    /// Number of parent hops from `id` down to `ancestor`.
    pub fn ancestor_depth(&self, id: &Hash, ancestor: &Hash) -> Result<u64, InventoryError> {
        let mut depth = 0;
        let mut cursor = *id;
        loop {
            if cursor == *ancestor {
                return Ok(depth);
            }
            if cursor.is_zero() {
                return Err(InventoryError::NotAnAncestor {
                    ancestor: *ancestor,
                    descendant: *id,
                });
            }
            let rec = self
                .block(&cursor)
                .ok_or(InventoryError::UnknownBlock(cursor))?;
            cursor = rec.block.prev_id;
            depth += 1;
        }
    }

    /// Lowest common ancestor of two chains.
    ///
    /// Equalizes heights by walking the higher chain down, then co-walks
    /// both until they meet; in a singly-rooted tree the meeting point is
    /// the LCA. Two chains sharing no real block meet at the zero
    /// sentinel.
    pub fn lca(&self, a: &Hash, b: &Hash) -> Result<Hash, InventoryError> {
        let mut x = *a;
        let mut y = *b;
        let mut hx = self.height_of(&x)?;
        let mut hy = self.height_of(&y)?;

        while hx > hy {
            x = self.parent_of(&x)?;
            hx -= 1;
        }
        while hy > hx {
            y = self.parent_of(&y)?;
            hy -= 1;
        }
        while x != y {
            x = self.parent_of(&x)?;
            y = self.parent_of(&y)?;
        }
        Ok(x)
    }

    /// Total work of the chain ending at `head`; the zero sentinel has
    /// none.
    pub fn total_work(&self, head: &Hash) -> Option<U256> {
        if head.is_zero() {
            return Some(U256::zero());
        }
        self.block(head).map(|rec| rec.total_work)
    }

    /// The stored block with the most total work, if any.
    pub fn best_block(&self) -> Option<Hash> {
        self.blocks
            .iter()
            .map(|entry| (entry.total_work, *entry.key()))
            .max()
            .map(|(_, id)| id)
    }

    /// Entity counts `(blocks, merkles, txs)`.
    pub fn counts(&self) -> (usize, usize, usize) {
        (self.blocks.len(), self.merkles.len(), self.txs.len())
    }

    fn height_of(&self, id: &Hash) -> Result<u64, InventoryError> {
        if id.is_zero() {
            return Ok(0);
        }
        self.block(id)
            .map(|rec| rec.height)
            .ok_or(InventoryError::UnknownBlock(*id))
    }

    fn parent_of(&self, id: &Hash) -> Result<Hash, InventoryError> {
        self.block(id)
            .map(|rec| rec.block.prev_id)
            .ok_or(InventoryError::UnknownBlock(*id))
    }
}
