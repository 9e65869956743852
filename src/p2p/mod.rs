//! P2P module - framed transport and the chain synchronization protocol

mod sync;
mod transport;

pub use sync::*;
pub use transport::*;
