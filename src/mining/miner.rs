//! Block miner implementation
//!
//! A single-threaded search loop holding at most one active template.
//! Work happens in fixed-size nonce batches so a new mining target is
//! picked up promptly without mid-batch cancellation machinery. Nonce
//! exhaustion re-rolls the noise field, extending the effective search
//! space beyond 64 bits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::consensus::Block;
use crate::events::{CandidateHead, EventBus, MiningTarget};
use crate::mining::BlockTemplate;
use crate::params::Params;
use crate::storage::Inventory;
use crate::crypto::Hash;

/// Nonce attempts between checks for a new target.
const NONCE_BATCH: u64 = 20_000;

/// How long to sleep when no template is available.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Block miner.
pub struct Miner {
    params: Params,
    inv: Arc<Inventory>,
    payout: Hash,
    targets: broadcast::Receiver<MiningTarget>,
    bus: EventBus,
}

impl Miner {
    /// Create a miner paying rewards to `payout`.
    pub fn new(params: Params, inv: Arc<Inventory>, payout: Hash, bus: &EventBus) -> Self {
        Self {
            params,
            inv,
            payout,
            targets: bus.subscribe_mining_targets(),
            bus: bus.clone(),
        }
    }

    /// Run the search loop until the target channel closes.
    ///
    /// Blocking; meant for a dedicated OS thread.
    pub fn run(mut self) {
        let mut template: Option<BlockTemplate> = None;
        loop {
            match self.latest_target() {
                TargetUpdate::New(target) => {
                    match BlockTemplate::build(&self.params, &self.inv, &target, &self.payout) {
                        Ok(built) => {
                            debug!(head = %target.head, txs = target.tx_ids.len(), "new block template");
                            template = Some(built);
                        }
                        Err(err) => {
                            warn!(%err, "failed to build block template");
                            template = None;
                        }
                    }
                }
                TargetUpdate::None => {}
                TargetUpdate::Shutdown => return,
            }

            let Some(active) = template.as_mut() else {
                std::thread::sleep(IDLE_POLL);
                continue;
            };

            if let Some(block) = search_batch(active) {
                info!(id = %block.id(), parent = %block.prev_id, "mined block");
                self.bus.publish_candidate_head(CandidateHead {
                    head: block.id(),
                    blocks: vec![block],
                    merkles: active.merkle.nodes.clone(),
                    txs: vec![active.coinbase.clone()],
                });
            }
        }
    }

    /// Drain the target channel down to the most recent entry.
    fn latest_target(&mut self) -> TargetUpdate {
        let mut latest = None;
        loop {
            match self.targets.try_recv() {
                Ok(target) => latest = Some(target),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(broadcast::error::TryRecvError::Closed) => {
                    return match latest {
                        Some(target) => TargetUpdate::New(target),
                        None => TargetUpdate::Shutdown,
                    }
                }
            }
        }
        match latest {
            Some(target) => TargetUpdate::New(target),
            None => TargetUpdate::None,
        }
    }
}

enum TargetUpdate {
    New(MiningTarget),
    None,
    Shutdown,
}

/// Try one batch of nonces against the template's target.
///
/// On success the template's nonce is advanced past the solution so the
/// loop keeps mining the same template instead of re-finding the same
/// block.
fn search_batch(template: &mut BlockTemplate) -> Option<Block> {
    for _ in 0..NONCE_BATCH {
        let candidate = template.block;
        let found = candidate.meets_target();
        if template.block.nonce == u64::MAX {
            template.reroll_noise();
        } else {
            template.block.nonce += 1;
        }
        if found {
            return Some(candidate);
        }
    }
    None
}
