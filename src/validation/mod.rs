//! Transaction types and signing

mod transaction;

pub use transaction::*;
