//! Peer chain synchronization
//!
//! A symmetric, message-driven protocol run once per connected peer. The
//! sides compare total work, agree on the lowest common ancestor, move the
//! missing blocks and their entities to the lower-work side, and hand the
//! result to the candidate pipeline as a single event. Only cheap checks
//! happen here; full consensus and UTXO verification is deferred to the
//! inventory and chain state.

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;
use tracing::debug;

use crate::codec::{expect_end, get_bool, get_hash, get_u64, put_bool, put_hash, put_u64, WireError};
use crate::consensus::{work_for_target, Block};
use crate::crypto::{Hash, MerkleNode};
use crate::events::CandidateHead;
use crate::p2p::{FramedTransport, TransportError};
use crate::storage::Inventory;
use crate::validation::Tx;
use crate::U256;

/// Upper bound on the number of blocks accepted in one exchange.
const MAX_BLOCKS_PER_SYNC: u64 = 1_048_576;

/// Sync protocol errors. Any of these aborts only the current exchange.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("peer sent an entity that does not hash to the requested id")]
    HashMismatch,
    #[error("peer requested unknown entity {0}")]
    UnknownEntity(Hash),
    #[error("peer expected a different head than ours")]
    HeadMismatch,
    #[error("received chain failed quick verification: {0}")]
    QuickVerify(&'static str),
    #[error("local chain is missing block {0}")]
    MissingLocal(Hash),
    #[error("peer did not acknowledge completion")]
    NoAck,
}

/// How an exchange ended.
#[derive(Debug)]
pub enum SyncOutcome {
    /// Nothing to do: equal work, or the better chain is already known.
    Canceled,
    /// We served our chain to the peer.
    Sent { blocks: usize },
    /// We received a better chain, ready for the candidate pipeline.
    Received(CandidateHead),
}

/// Run one synchronization exchange against a connected peer.
///
/// `head` is this node's current best block (zero for a fresh node). The
/// side with less total work receives; the other side sends; equal work
/// cancels on both ends.
pub async fn run_sync<T: FramedTransport>(
    inv: &Inventory,
    head: Hash,
    transport: &mut T,
) -> Result<SyncOutcome, SyncError> {
    let my_work = inv.total_work(&head).ok_or(SyncError::MissingLocal(head))?;

    let mut frame = Vec::with_capacity(64);
    put_hash(&mut frame, &Hash::from_u256(my_work));
    put_hash(&mut frame, &head);
    transport.send(&frame).await?;

    let peer_frame = transport.recv().await?;
    let mut cursor = peer_frame.as_slice();
    let peer_work = get_hash(&mut cursor)?.to_u256();
    let peer_head = get_hash(&mut cursor)?;
    expect_end(cursor)?;

    if peer_work == my_work {
        debug!(%head, "peer carries equal work, nothing to sync");
        return Ok(SyncOutcome::Canceled);
    }
    if my_work < peer_work {
        receive_chain(inv, my_work, peer_head, transport).await
    } else {
        send_chain(inv, head, transport).await
    }
}

/// Receiver half: negotiate the LCA, pull blocks and entities, assemble
/// the candidate event.
async fn receive_chain<T: FramedTransport>(
    inv: &Inventory,
    my_work: U256,
    peer_head: Hash,
    transport: &mut T,
) -> Result<SyncOutcome, SyncError> {
    // A known peer head means this sync already happened or is in flight.
    if inv.has_block(&peer_head) {
        send_bool(transport, false).await?;
        debug!(%peer_head, "already have the peer's head, canceling");
        return Ok(SyncOutcome::Canceled);
    }
    send_bool(transport, true).await?;
    send_hash(transport, &peer_head).await?;

    // The sender walks its ancestry downward; confirm the first id we have.
    let lca = loop {
        let id = recv_hash(transport).await?;
        let known = id.is_zero() || inv.has_block(&id);
        send_bool(transport, known).await?;
        if known {
            break id;
        }
    };
    debug!(%lca, "agreed on common ancestor");

    let count = recv_u64(transport).await?;
    if count == 0 {
        return Err(SyncError::QuickVerify("empty chain"));
    }
    if count > MAX_BLOCKS_PER_SYNC {
        return Err(SyncError::QuickVerify("oversized chain"));
    }
    let mut blocks_desc = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let frame = transport.recv().await?;
        blocks_desc.push(Block::decode_exact(&frame)?);
    }

    quick_verify(inv, my_work, &peer_head, &lca, &blocks_desc)?;

    let blocks_asc: Vec<Block> = blocks_desc.into_iter().rev().collect();
    let staged = exchange_entities(inv, &blocks_asc, transport).await?;

    send_hash(transport, &Hash::zero()).await?;
    if !recv_bool(transport).await? {
        return Err(SyncError::NoAck);
    }

    Ok(SyncOutcome::Received(assemble_candidate(
        inv, peer_head, blocks_asc, &staged,
    )))
}

/// Sender half: confirm roles, lead the LCA walk, stream blocks, serve
/// entity requests until the zero sentinel.
async fn send_chain<T: FramedTransport>(
    inv: &Inventory,
    my_head: Hash,
    transport: &mut T,
) -> Result<SyncOutcome, SyncError> {
    if !recv_bool(transport).await? {
        debug!("peer canceled the exchange");
        return Ok(SyncOutcome::Canceled);
    }
    let expected = recv_hash(transport).await?;
    if expected != my_head {
        return Err(SyncError::HeadMismatch);
    }

    let mut cursor = my_head;
    let lca = loop {
        cursor = inv
            .block(&cursor)
            .ok_or(SyncError::MissingLocal(cursor))?
            .block
            .prev_id;
        send_hash(transport, &cursor).await?;
        if recv_bool(transport).await? {
            break cursor;
        }
        if cursor.is_zero() {
            // The zero sentinel is known to everyone.
            return Err(SyncError::QuickVerify("peer rejected the zero ancestor"));
        }
    };

    let depth = inv
        .ancestor_depth(&my_head, &lca)
        .map_err(|_| SyncError::MissingLocal(my_head))?;
    send_u64(transport, depth).await?;

    let mut cursor = my_head;
    for _ in 0..depth {
        let rec = inv
            .block(&cursor)
            .ok_or(SyncError::MissingLocal(cursor))?;
        transport.send(&rec.block.encode()).await?;
        cursor = rec.block.prev_id;
    }

    loop {
        let id = recv_hash(transport).await?;
        if id.is_zero() {
            send_bool(transport, true).await?;
            debug!(blocks = depth, "served chain to peer");
            return Ok(SyncOutcome::Sent {
                blocks: depth as usize,
            });
        }
        let mut frame = Vec::new();
        if let Some(stored) = inv.tx(&id) {
            put_bool(&mut frame, true);
            stored.tx.encode_into(&mut frame);
        } else if let Some(stored) = inv.merkle(&id) {
            put_bool(&mut frame, false);
            stored.node.encode_into(&mut frame);
        } else {
            return Err(SyncError::UnknownEntity(id));
        }
        transport.send(&frame).await?;
    }
}

/// Cheap receiver-side checks before any expensive entity traffic.
fn quick_verify(
    inv: &Inventory,
    my_work: U256,
    peer_head: &Hash,
    lca: &Hash,
    blocks_desc: &[Block],
) -> Result<(), SyncError> {
    if blocks_desc[0].id() != *peer_head {
        return Err(SyncError::QuickVerify("chain does not hash to the claimed head"));
    }
    for pair in blocks_desc.windows(2) {
        if pair[0].prev_id != pair[1].id() {
            return Err(SyncError::QuickVerify("chain is not continuous"));
        }
    }
    let last = blocks_desc.last().expect("chain is non-empty");
    if last.prev_id != *lca {
        return Err(SyncError::QuickVerify("chain does not attach to the agreed ancestor"));
    }

    let lca_work = inv
        .total_work(lca)
        .ok_or(SyncError::MissingLocal(*lca))?;
    let mut new_work = lca_work;
    for block in blocks_desc {
        new_work = new_work.saturating_add(work_for_target(&block.target));
    }
    if new_work <= my_work {
        return Err(SyncError::QuickVerify("chain does not carry more work"));
    }

    for block in blocks_desc {
        if !block.meets_target() {
            return Err(SyncError::QuickVerify("block does not beat its target"));
        }
    }
    Ok(())
}

/// An entity learned during the exchange, held until integration.
enum Staged {
    Tx(Tx),
    Merkle(MerkleNode),
}

/// Walk the merkle trees of the new blocks breadth-first, requesting every
/// transaction and merkle node the inventory does not already have.
async fn exchange_entities<T: FramedTransport>(
    inv: &Inventory,
    blocks_asc: &[Block],
    transport: &mut T,
) -> Result<HashMap<Hash, Staged>, SyncError> {
    let mut staged: HashMap<Hash, Staged> = HashMap::new();
    for block in blocks_asc {
        let mut queue = VecDeque::from([block.merkle_root]);
        while let Some(id) = queue.pop_front() {
            if inv.entity_vsize(&id).is_some() || staged.contains_key(&id) {
                continue;
            }

            send_hash(transport, &id).await?;
            let frame = transport.recv().await?;
            let mut cursor = frame.as_slice();
            let is_tx = get_bool(&mut cursor)?;
            if is_tx {
                let tx = Tx::decode(&mut cursor)?;
                expect_end(cursor)?;
                if tx.id() != id {
                    return Err(SyncError::HashMismatch);
                }
                staged.insert(id, Staged::Tx(tx));
            } else {
                let node = MerkleNode::decode(&mut cursor)?;
                expect_end(cursor)?;
                if node.id() != id {
                    return Err(SyncError::HashMismatch);
                }
                queue.push_back(node.left);
                if !node.is_self_pair() {
                    queue.push_back(node.right);
                }
                staged.insert(id, Staged::Merkle(node));
            }
        }
    }
    Ok(staged)
}

/// Arrange everything learned into one candidate event, ordered so that
/// insertion always sees producers before consumers: transactions in
/// block-then-leaf order, merkle nodes children before parents, blocks
/// ascending from just above the LCA.
fn assemble_candidate(
    inv: &Inventory,
    peer_head: Hash,
    blocks_asc: Vec<Block>,
    staged: &HashMap<Hash, Staged>,
) -> CandidateHead {
    let mut merkles = Vec::new();
    let mut txs = Vec::new();
    let mut seen: HashSet<Hash> = HashSet::new();

    for block in &blocks_asc {
        let mut block_merkles = Vec::new();
        let mut queue = VecDeque::from([block.merkle_root]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            match staged.get(&id) {
                Some(Staged::Merkle(node)) => {
                    block_merkles.push(*node);
                    queue.push_back(node.left);
                    if !node.is_self_pair() {
                        queue.push_back(node.right);
                    }
                }
                Some(Staged::Tx(tx)) => txs.push(tx.clone()),
                // Already in the inventory, nothing to carry.
                None => debug_assert!(inv.entity_vsize(&id).is_some()),
            }
        }
        block_merkles.reverse();
        merkles.extend(block_merkles);
    }

    CandidateHead {
        head: peer_head,
        blocks: blocks_asc,
        merkles,
        txs,
    }
}

async fn send_hash<T: FramedTransport>(t: &mut T, hash: &Hash) -> Result<(), SyncError> {
    let mut frame = Vec::with_capacity(32);
    put_hash(&mut frame, hash);
    t.send(&frame).await?;
    Ok(())
}

async fn recv_hash<T: FramedTransport>(t: &mut T) -> Result<Hash, SyncError> {
    let frame = t.recv().await?;
    let mut cursor = frame.as_slice();
    let hash = get_hash(&mut cursor)?;
    expect_end(cursor)?;
    Ok(hash)
}

async fn send_bool<T: FramedTransport>(t: &mut T, value: bool) -> Result<(), SyncError> {
    let mut frame = Vec::with_capacity(1);
    put_bool(&mut frame, value);
    t.send(&frame).await?;
    Ok(())
}

async fn recv_bool<T: FramedTransport>(t: &mut T) -> Result<bool, SyncError> {
    let frame = t.recv().await?;
    let mut cursor = frame.as_slice();
    let value = get_bool(&mut cursor)?;
    expect_end(cursor)?;
    Ok(value)
}

async fn send_u64<T: FramedTransport>(t: &mut T, value: u64) -> Result<(), SyncError> {
    let mut frame = Vec::with_capacity(8);
    put_u64(&mut frame, value);
    t.send(&frame).await?;
    Ok(())
}

async fn recv_u64<T: FramedTransport>(t: &mut T) -> Result<u64, SyncError> {
    let frame = t.recv().await?;
    let mut cursor = frame.as_slice();
    let value = get_u64(&mut cursor)?;
    expect_end(cursor)?;
    Ok(value)
}
