//! Pyrite (PYR) Blockchain Core Library
//!
//! A proof-of-work cryptocurrency engine: content-addressed inventory of
//! blocks, merkle nodes and transactions, consensus verification, a UTXO
//! chain state with reorganization support, difficulty retargeting, mining,
//! and the peer chain-synchronization protocol.
//!
//! PYR is the short form used in protocol identifiers and logs.

pub mod params;
pub mod codec;
pub mod crypto;
pub mod consensus;
pub mod validation;
pub mod storage;
pub mod mining;
pub mod p2p;
pub mod events;
pub mod node;

use uint::construct_uint;

construct_uint! {
    /// 256-bit unsigned integer used for targets and accumulated work.
    pub struct U256(4);
}

construct_uint! {
    /// 512-bit intermediate used for overflow-free target arithmetic.
    pub struct U512(8);
}
