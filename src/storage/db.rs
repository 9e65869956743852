//! Database persistence layer using Sled
//!
//! One tree per entity kind, keyed by entity id, holding the textual
//! record format. Loading re-checks that every record still hashes to the
//! key it was filed under.

use std::path::Path;

use sled::{Db, Tree};
use thiserror::Error;

use crate::crypto::Hash;
use crate::storage::records::{
    format_block_record, format_merkle_record, format_tx_record, parse_block_record,
    parse_merkle_record, parse_tx_record, RecordError,
};
use crate::storage::{StoredBlock, StoredMerkle, StoredTx};

/// Persistence errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sled(#[from] sled::Error),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("stored record is not valid utf-8")]
    NotUtf8,
    #[error("stored record does not hash to its key")]
    IdentityMismatch,
}

/// Record store wrapper.
#[derive(Debug, Clone)]
pub struct RecordDb {
    blocks: Tree,
    merkles: Tree,
    txs: Tree,
    db: Db,
}

impl RecordDb {
    /// Open or create the database.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        Self::from_db(sled::open(path)?)
    }

    /// An in-memory database for tests and throwaway nodes.
    pub fn temporary() -> Result<Self, DbError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, DbError> {
        Ok(Self {
            blocks: db.open_tree("blocks")?,
            merkles: db.open_tree("merkles")?,
            txs: db.open_tree("txs")?,
            db,
        })
    }

    /// Persist a block record.
    pub fn save_block(&self, id: &Hash, rec: &StoredBlock) -> Result<(), DbError> {
        self.blocks
            .insert(id.0, format_block_record(rec).into_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    /// Persist a merkle record.
    pub fn save_merkle(&self, id: &Hash, rec: &StoredMerkle) -> Result<(), DbError> {
        self.merkles
            .insert(id.0, format_merkle_record(rec).into_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    /// Persist a transaction record.
    pub fn save_tx(&self, id: &Hash, rec: &StoredTx) -> Result<(), DbError> {
        self.txs.insert(id.0, format_tx_record(rec).into_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    /// Load every block record.
    pub fn load_blocks(&self) -> Result<Vec<StoredBlock>, DbError> {
        let mut out = Vec::new();
        for item in self.blocks.iter() {
            let (key, value) = item?;
            let rec = parse_block_record(text(&value)?)?;
            if rec.block.id().0 != key.as_ref() {
                return Err(DbError::IdentityMismatch);
            }
            out.push(rec);
        }
        Ok(out)
    }

    /// Load every merkle record.
    pub fn load_merkles(&self) -> Result<Vec<StoredMerkle>, DbError> {
        let mut out = Vec::new();
        for item in self.merkles.iter() {
            let (key, value) = item?;
            let rec = parse_merkle_record(text(&value)?)?;
            if rec.node.id().0 != key.as_ref() {
                return Err(DbError::IdentityMismatch);
            }
            out.push(rec);
        }
        Ok(out)
    }

    /// Load every transaction record.
    pub fn load_txs(&self) -> Result<Vec<StoredTx>, DbError> {
        let mut out = Vec::new();
        for item in self.txs.iter() {
            let (key, value) = item?;
            let rec = parse_tx_record(text(&value)?)?;
            if rec.tx.id().0 != key.as_ref() {
                return Err(DbError::IdentityMismatch);
            }
            out.push(rec);
        }
        Ok(out)
    }
}

fn text(value: &sled::IVec) -> Result<&str, DbError> {
    std::str::from_utf8(value).map_err(|_| DbError::NotUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::Block;
    use crate::crypto::hash_bytes;
    use crate::U256;

    fn sample_block() -> StoredBlock {
        StoredBlock {
            block: Block {
                prev_id: Hash::zero(),
                merkle_root: hash_bytes(b"merkle"),
                target: Hash([0x3f; 32]),
                noise: hash_bytes(b"noise"),
                nonce: 7,
                mined_time: 1_700_000_000,
            },
            height: 1,
            total_work: U256::from(4u64),
        }
    }

    #[test]
    fn test_save_and_load_block() {
        let db = RecordDb::temporary().unwrap();
        let rec = sample_block();
        db.save_block(&rec.block.id(), &rec).unwrap();

        let loaded = db.load_blocks().unwrap();
        assert_eq!(loaded, vec![rec]);
    }

    #[test]
    fn test_identity_mismatch_detected() {
        let db = RecordDb::temporary().unwrap();
        let rec = sample_block();
        db.save_block(&hash_bytes(b"wrong key"), &rec).unwrap();

        assert!(matches!(db.load_blocks(), Err(DbError::IdentityMismatch)));
    }

    #[test]
    fn test_save_is_idempotent() {
        let db = RecordDb::temporary().unwrap();
        let rec = sample_block();
        db.save_block(&rec.block.id(), &rec).unwrap();
        db.save_block(&rec.block.id(), &rec).unwrap();
        assert_eq!(db.load_blocks().unwrap().len(), 1);
    }
}
