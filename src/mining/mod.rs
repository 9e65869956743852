//! Mining module - template construction and the nonce search loop

mod miner;
mod template;

pub use miner::*;
pub use template::*;
