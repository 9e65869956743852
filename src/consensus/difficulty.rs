//! Difficulty adjustment algorithm
//!
//! Pure target arithmetic. The target is recomputed once per difficulty
//! period from the measured time span of the completed period, clamped to
//! a 4x swing in either direction and to the network maximum. Between
//! boundaries the parent's target carries over unchanged.

use crate::crypto::Hash;
use crate::params::Params;
use crate::storage::Inventory;
use crate::{U256, U512};

/// Work implied by a target: `2^256 / target`.
///
/// A zero target carries no work; stored blocks always have a nonzero
/// target because their identity had to beat it.
pub fn work_for_target(target: &Hash) -> U256 {
    let target = widen(target.to_u256());
    if target.is_zero() {
        return U256::zero();
    }
    narrow_saturating((U512::one() << 256) / target)
}

/// Compute the target required of the block that extends `prev_id`.
///
/// Returns `None` when the parent chain cannot be resolved from the
/// inventory.
pub fn next_target(params: &Params, inv: &Inventory, prev_id: &Hash) -> Option<Hash> {
    if prev_id.is_zero() {
        return Some(params.genesis_target);
    }

    let prev = inv.block(prev_id)?;
    let new_height = prev.height + 1;
    if new_height % params.difficulty_period != 0 {
        return Some(prev.block.target);
    }

    // The completed period covers heights [new_height - period, new_height - 1].
    // Height 0 is the synthetic zero block and contributes no timestamp, so
    // the first period starts measuring at height 1.
    let first_height = (new_height - params.difficulty_period).max(1);
    let mut first = prev.clone();
    while first.height > first_height {
        first = inv.block(&first.block.prev_id)?;
    }

    let actual = prev.block.mined_time.saturating_sub(first.block.mined_time);
    let desired = params.block_target_secs * params.difficulty_period;

    Some(retarget(
        &prev.block.target,
        actual,
        desired,
        &params.max_target,
    ))
}

/// Scale `prev_target` by `actual / desired`, clamped to `[prev/4, prev*4]`
/// and to the network maximum.
pub fn retarget(prev_target: &Hash, actual_secs: u64, desired_secs: u64, max_target: &Hash) -> Hash {
    let prev = prev_target.to_u256();
    let scaled = widen(prev) * U512::from(actual_secs) / U512::from(desired_secs.max(1));
    let unclamped = narrow_saturating(scaled);

    let floor = prev / 4;
    let ceiling = prev.checked_mul(U256::from(4u64)).unwrap_or(U256::MAX);
    let clamped = unclamped.max(floor).min(ceiling).max(U256::one());

    Hash::from_u256(clamped.min(max_target.to_u256()))
}

fn widen(value: U256) -> U512 {
    U512::from_big_endian(&value.to_big_endian())
}

fn narrow_saturating(value: U512) -> U256 {
    let bytes = value.to_big_endian();
    if bytes[..32].iter().any(|b| *b != 0) {
        return U256::MAX;
    }
    let mut low = [0u8; 32];
    low.copy_from_slice(&bytes[32..]);
    U256::from_big_endian(&low)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target_from_u64(value: u64) -> Hash {
        Hash::from_u256(U256::from(value))
    }

    #[test]
    fn test_work_inversely_proportional_to_target() {
        let easy = work_for_target(&Hash([0xff; 32]));
        let hard = work_for_target(&Hash::from_u256(U256::from(1u64) << 200));
        assert!(hard > easy);
    }

    #[test]
    fn test_work_of_zero_target_is_zero() {
        assert!(work_for_target(&Hash::zero()).is_zero());
    }

    #[test]
    fn test_retarget_unchanged_on_exact_pace() {
        let prev = target_from_u64(1_000_000);
        let max = Hash([0xff; 32]);
        assert_eq!(retarget(&prev, 800, 800, &max), prev);
    }

    #[test]
    fn test_retarget_scales_with_time() {
        let prev = target_from_u64(1_000_000);
        let max = Hash([0xff; 32]);
        // Twice as slow: target doubles (mining gets easier).
        assert_eq!(retarget(&prev, 1600, 800, &max), target_from_u64(2_000_000));
        // Twice as fast: target halves.
        assert_eq!(retarget(&prev, 400, 800, &max), target_from_u64(500_000));
    }

    #[test]
    fn test_retarget_clamped_to_4x() {
        let prev = target_from_u64(1_000_000);
        let max = Hash([0xff; 32]);
        assert_eq!(
            retarget(&prev, 800_000, 800, &max),
            target_from_u64(4_000_000)
        );
        assert_eq!(retarget(&prev, 0, 800, &max), target_from_u64(250_000));
    }

    #[test]
    fn test_retarget_respects_network_max() {
        let prev = target_from_u64(1_000_000);
        let max = target_from_u64(1_500_000);
        assert_eq!(retarget(&prev, 3200, 800, &max), max);
    }

    #[test]
    fn test_retarget_never_zero() {
        let prev = target_from_u64(1);
        let max = Hash([0xff; 32]);
        assert_eq!(retarget(&prev, 0, 800, &max), target_from_u64(1));
    }

    #[test]
    fn test_retarget_huge_target_does_not_overflow() {
        // The params invariant caps targets at 2^254 - 1, so a 4x swing fits.
        let prev = Hash::from_u256((U256::one() << 254) - 1);
        let max = Hash::from_u256((U256::one() << 254) - 1);
        let result = retarget(&prev, 3200, 800, &max);
        assert_eq!(result, max);
    }
}
