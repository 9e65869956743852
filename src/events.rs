//! Event bus
//!
//! Typed broadcast channels, one per topic, connecting the node pipeline,
//! the miner and the peer-sync tasks. Publishing never blocks and never
//! fails: a topic with no live subscribers simply drops the event.

use tokio::sync::broadcast;

use crate::consensus::Block;
use crate::crypto::{Hash, MerkleNode};
use crate::validation::Tx;

/// Capacity of each topic's ring buffer.
const TOPIC_CAPACITY: usize = 256;

/// What the miner should be working on.
#[derive(Debug, Clone)]
pub struct MiningTarget {
    /// Head the next block must extend.
    pub head: Hash,
    /// Required proof-of-work target.
    pub target: Hash,
    /// Mempool transactions selected for inclusion, in order.
    pub tx_ids: Vec<Hash>,
}

/// A candidate chain head with every entity needed to evaluate it, in
/// insertion order: transactions before the merkle nodes referencing them,
/// merkle children before parents, blocks ascending.
#[derive(Debug, Clone)]
pub struct CandidateHead {
    pub head: Hash,
    pub blocks: Vec<Block>,
    pub merkles: Vec<MerkleNode>,
    pub txs: Vec<Tx>,
}

/// A transaction submitted for mempool admission.
#[derive(Debug, Clone)]
pub struct CandidateTx {
    pub tx: Tx,
}

/// The per-topic broadcast bus.
#[derive(Clone)]
pub struct EventBus {
    mining_targets: broadcast::Sender<MiningTarget>,
    candidate_heads: broadcast::Sender<CandidateHead>,
    candidate_txs: broadcast::Sender<CandidateTx>,
    validated_heads: broadcast::Sender<Hash>,
    validated_txs: broadcast::Sender<Hash>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            mining_targets: broadcast::channel(TOPIC_CAPACITY).0,
            candidate_heads: broadcast::channel(TOPIC_CAPACITY).0,
            candidate_txs: broadcast::channel(TOPIC_CAPACITY).0,
            validated_heads: broadcast::channel(TOPIC_CAPACITY).0,
            validated_txs: broadcast::channel(TOPIC_CAPACITY).0,
        }
    }

    pub fn publish_mining_target(&self, target: MiningTarget) {
        let _ = self.mining_targets.send(target);
    }

    pub fn publish_candidate_head(&self, candidate: CandidateHead) {
        let _ = self.candidate_heads.send(candidate);
    }

    pub fn publish_candidate_tx(&self, candidate: CandidateTx) {
        let _ = self.candidate_txs.send(candidate);
    }

    pub fn publish_validated_head(&self, head: Hash) {
        let _ = self.validated_heads.send(head);
    }

    pub fn publish_validated_tx(&self, tx_id: Hash) {
        let _ = self.validated_txs.send(tx_id);
    }

    pub fn subscribe_mining_targets(&self) -> broadcast::Receiver<MiningTarget> {
        self.mining_targets.subscribe()
    }

    pub fn subscribe_candidate_heads(&self) -> broadcast::Receiver<CandidateHead> {
        self.candidate_heads.subscribe()
    }

    pub fn subscribe_candidate_txs(&self) -> broadcast::Receiver<CandidateTx> {
        self.candidate_txs.subscribe()
    }

    pub fn subscribe_validated_heads(&self) -> broadcast::Receiver<Hash> {
        self.validated_heads.subscribe()
    }

    pub fn subscribe_validated_txs(&self) -> broadcast::Receiver<Hash> {
        self.validated_txs.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
