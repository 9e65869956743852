//! Network parameters
//!
//! Fixed per-network configuration. Two profiles exist: `production` for
//! the real network and `development` for local nodes and tests. Params
//! never change for the lifetime of a process.

use crate::crypto::Hash;
use thiserror::Error;

/// Errors raised by [`Params::validate`].
#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("maximum target exceeds 2^254 - 1")]
    MaxTargetTooHigh,
    #[error("difficulty period must be at least 4 blocks")]
    PeriodTooShort,
}

/// Immutable per-network configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Params {
    /// Reward minted by each block's coinbase (base units).
    pub block_reward: u64,
    /// Number of blocks between difficulty retargets.
    pub difficulty_period: u64,
    /// Desired seconds per block.
    pub block_target_secs: u64,
    /// Maximum total transaction bytes per block.
    pub max_block_vsize: u64,
    /// Maximum bytes per transaction.
    pub max_tx_vsize: u64,
    /// Easiest target the network ever allows.
    pub max_target: Hash,
    /// Target required of the very first block.
    pub genesis_target: Hash,
}

impl Params {
    /// The production network profile.
    pub fn production() -> Self {
        Self {
            block_reward: 50 * 100_000_000,
            difficulty_period: 2016,
            block_target_secs: 600,
            max_block_vsize: 1_000_000,
            max_tx_vsize: 100_000,
            max_target: easy_target(&[0x00, 0x00, 0x0f]),
            genesis_target: easy_target(&[0x00, 0x00, 0x00]),
        }
    }

    /// A profile with trivial difficulty for local development and tests.
    pub fn development() -> Self {
        Self {
            block_reward: 50 * 100_000_000,
            difficulty_period: 8,
            block_target_secs: 10,
            max_block_vsize: 100_000,
            max_tx_vsize: 10_000,
            max_target: easy_target(&[0x3f]),
            genesis_target: easy_target(&[0x3f]),
        }
    }

    /// Check the invariants the retarget arithmetic relies on.
    ///
    /// The maximum target must fit below 2^254 so quadrupling it cannot
    /// overflow 256 bits, and a period shorter than 4 blocks leaves the
    /// clamp window degenerate.
    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.max_target.0[0] > 0x3f {
            return Err(ParamsError::MaxTargetTooHigh);
        }
        if self.difficulty_period < 4 {
            return Err(ParamsError::PeriodTooShort);
        }
        Ok(())
    }

    /// Theoretical maximum number of transactions a block can carry.
    pub fn max_block_tx_count(&self) -> u64 {
        self.max_block_vsize / crate::validation::Tx::MIN_VSIZE
    }
}

/// Build a target from a leading prefix followed by 0xff bytes.
fn easy_target(prefix: &[u8]) -> Hash {
    let mut bytes = [0xffu8; 32];
    bytes[..prefix.len()].copy_from_slice(prefix);
    Hash(bytes)
}
