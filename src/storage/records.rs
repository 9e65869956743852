//! Durable record format
//!
//! Newline-delimited text, one record per entity. Hashes are lowercase
//! hex, integers decimal, keys and signatures base64, total work 64 hex
//! digits. Formatting then parsing a record is the identity, hash
//! identity included.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;

use crate::consensus::Block;
use crate::crypto::{EcdsaSignature, Hash, MerkleNode, PublicKey, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use crate::storage::{StoredBlock, StoredMerkle, StoredTx};
use crate::validation::{Tx, TxIn, TxOut, Utxo};
use crate::U256;

/// Record parsing errors.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record ends early at line {0}")]
    Truncated(usize),
    #[error("line {0}: invalid hash")]
    BadHash(usize),
    #[error("line {0}: invalid integer")]
    BadInt(usize),
    #[error("line {0}: invalid boolean")]
    BadBool(usize),
    #[error("line {0}: invalid base64 field")]
    BadBase64(usize),
    #[error("line {0}: key or signature has the wrong length")]
    BadFieldLength(usize),
    #[error("line {0}: invalid total work")]
    BadWork(usize),
    #[error("unexpected content after the record")]
    TrailingContent,
}

/// Format a block record: 8 lines.
pub fn format_block_record(rec: &StoredBlock) -> String {
    let mut out = String::new();
    out.push_str(&rec.block.prev_id.to_hex());
    out.push('\n');
    out.push_str(&rec.block.merkle_root.to_hex());
    out.push('\n');
    out.push_str(&rec.block.target.to_hex());
    out.push('\n');
    out.push_str(&rec.block.noise.to_hex());
    out.push('\n');
    out.push_str(&rec.block.nonce.to_string());
    out.push('\n');
    out.push_str(&rec.block.mined_time.to_string());
    out.push('\n');
    out.push_str(&rec.height.to_string());
    out.push('\n');
    out.push_str(&hex::encode(rec.total_work.to_big_endian()));
    out.push('\n');
    out
}

/// Parse a block record.
pub fn parse_block_record(text: &str) -> Result<StoredBlock, RecordError> {
    let mut lines = LineReader::new(text);
    let rec = StoredBlock {
        block: Block {
            prev_id: lines.hash()?,
            merkle_root: lines.hash()?,
            target: lines.hash()?,
            noise: lines.hash()?,
            nonce: lines.u64()?,
            mined_time: lines.u64()?,
        },
        height: lines.u64()?,
        total_work: lines.work()?,
    };
    lines.finish()?;
    Ok(rec)
}

/// Format a merkle record: 3 lines.
pub fn format_merkle_record(rec: &StoredMerkle) -> String {
    format!(
        "{}\n{}\n{}\n",
        rec.node.left.to_hex(),
        rec.node.right.to_hex(),
        rec.vsize
    )
}

/// Parse a merkle record.
pub fn parse_merkle_record(text: &str) -> Result<StoredMerkle, RecordError> {
    let mut lines = LineReader::new(text);
    let rec = StoredMerkle {
        node: MerkleNode::new(lines.hash()?, lines.hash()?),
        vsize: lines.u64()?,
    };
    lines.finish()?;
    Ok(rec)
}

/// Format a transaction record: 5 header lines, then 5 lines per input and
/// 2 lines per output.
pub fn format_tx_record(rec: &StoredTx) -> String {
    let mut out = String::new();
    out.push_str(&rec.vsize.to_string());
    out.push('\n');
    out.push_str(if rec.tx.is_coinbase { "true" } else { "false" });
    out.push('\n');
    out.push_str(&rec.tx.min_block.to_string());
    out.push('\n');
    out.push_str(&rec.tx.inputs.len().to_string());
    out.push('\n');
    out.push_str(&rec.tx.outputs.len().to_string());
    out.push('\n');
    for input in &rec.tx.inputs {
        out.push_str(&input.utxo.tx_id.to_hex());
        out.push('\n');
        out.push_str(&input.utxo.index.to_string());
        out.push('\n');
        out.push_str(&input.utxo.value.to_string());
        out.push('\n');
        out.push_str(&BASE64.encode(input.public_key.0));
        out.push('\n');
        out.push_str(&BASE64.encode(input.signature.0));
        out.push('\n');
    }
    for output in &rec.tx.outputs {
        out.push_str(&output.value.to_string());
        out.push('\n');
        out.push_str(&output.pubkey_hash.to_hex());
        out.push('\n');
    }
    out
}

/// Parse a transaction record.
pub fn parse_tx_record(text: &str) -> Result<StoredTx, RecordError> {
    let mut lines = LineReader::new(text);
    let vsize = lines.u64()?;
    let is_coinbase = lines.bool()?;
    let min_block = lines.u64()?;
    let input_count = lines.u64()?;
    let output_count = lines.u64()?;

    let mut inputs = Vec::with_capacity(input_count.min(1024) as usize);
    for _ in 0..input_count {
        let tx_id = lines.hash()?;
        let index = lines.u64()?;
        let value = lines.u64()?;
        let key: [u8; PUBLIC_KEY_LEN] = lines.base64()?;
        let sig: [u8; SIGNATURE_LEN] = lines.base64()?;
        inputs.push(TxIn {
            utxo: Utxo {
                tx_id,
                index,
                value,
            },
            public_key: PublicKey(key),
            signature: EcdsaSignature(sig),
        });
    }

    let mut outputs = Vec::with_capacity(output_count.min(1024) as usize);
    for _ in 0..output_count {
        let value = lines.u64()?;
        let pubkey_hash = lines.hash()?;
        outputs.push(TxOut { value, pubkey_hash });
    }

    lines.finish()?;
    Ok(StoredTx {
        tx: Tx {
            is_coinbase,
            min_block,
            inputs,
            outputs,
        },
        vsize,
    })
}

/// Cursor over the lines of a record.
struct LineReader<'a> {
    lines: std::str::Lines<'a>,
    at: usize,
}

impl<'a> LineReader<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            lines: text.lines(),
            at: 0,
        }
    }

    fn next(&mut self) -> Result<&'a str, RecordError> {
        self.at += 1;
        self.lines.next().ok_or(RecordError::Truncated(self.at))
    }

    fn hash(&mut self) -> Result<Hash, RecordError> {
        let line = self.next()?;
        Hash::from_hex(line).map_err(|_| RecordError::BadHash(self.at))
    }

    fn u64(&mut self) -> Result<u64, RecordError> {
        let line = self.next()?;
        line.parse().map_err(|_| RecordError::BadInt(self.at))
    }

    fn bool(&mut self) -> Result<bool, RecordError> {
        let line = self.next()?;
        line.parse().map_err(|_| RecordError::BadBool(self.at))
    }

    fn base64<const N: usize>(&mut self) -> Result<[u8; N], RecordError> {
        let line = self.next()?;
        let bytes = BASE64
            .decode(line)
            .map_err(|_| RecordError::BadBase64(self.at))?;
        bytes
            .try_into()
            .map_err(|_| RecordError::BadFieldLength(self.at))
    }

    fn work(&mut self) -> Result<U256, RecordError> {
        let line = self.next()?;
        let bytes = hex::decode(line).map_err(|_| RecordError::BadWork(self.at))?;
        if bytes.len() != 32 {
            return Err(RecordError::BadWork(self.at));
        }
        Ok(U256::from_big_endian(&bytes))
    }

    fn finish(mut self) -> Result<(), RecordError> {
        match self.lines.next() {
            None => Ok(()),
            Some(line) if line.is_empty() && self.lines.next().is_none() => Ok(()),
            Some(_) => Err(RecordError::TrailingContent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{hash_bytes, PrivateKey};
    use crate::validation::{sig_hash, signed_input};

    fn sample_block_record() -> StoredBlock {
        StoredBlock {
            block: Block {
                prev_id: hash_bytes(b"prev"),
                merkle_root: hash_bytes(b"merkle"),
                target: Hash([0x3f; 32]),
                noise: hash_bytes(b"noise"),
                nonce: 77,
                mined_time: 1_700_000_123,
            },
            height: 42,
            total_work: U256::from(123_456_789u64) << 64,
        }
    }

    fn sample_tx_record() -> StoredTx {
        let key = PrivateKey::generate();
        let outputs = vec![
            TxOut {
                value: 900,
                pubkey_hash: hash_bytes(b"to"),
            },
            TxOut {
                value: 50,
                pubkey_hash: hash_bytes(b"change"),
            },
        ];
        let digest = sig_hash(3, &outputs);
        let tx = Tx {
            is_coinbase: false,
            min_block: 3,
            inputs: vec![signed_input(
                Utxo {
                    tx_id: hash_bytes(b"origin"),
                    index: 1,
                    value: 1000,
                },
                &key,
                &digest,
            )],
            outputs,
        };
        let vsize = tx.vsize();
        StoredTx { tx, vsize }
    }

    #[test]
    fn test_block_record_roundtrip() {
        let rec = sample_block_record();
        let text = format_block_record(&rec);
        assert_eq!(text.lines().count(), 8);
        let parsed = parse_block_record(&text).unwrap();
        assert_eq!(parsed, rec);
        assert_eq!(parsed.block.id(), rec.block.id());
    }

    #[test]
    fn test_merkle_record_roundtrip() {
        let rec = StoredMerkle {
            node: MerkleNode::new(hash_bytes(b"l"), hash_bytes(b"r")),
            vsize: 512,
        };
        let text = format_merkle_record(&rec);
        assert_eq!(text.lines().count(), 3);
        let parsed = parse_merkle_record(&text).unwrap();
        assert_eq!(parsed, rec);
        assert_eq!(parsed.node.id(), rec.node.id());
    }

    #[test]
    fn test_tx_record_roundtrip() {
        let rec = sample_tx_record();
        let text = format_tx_record(&rec);
        assert_eq!(text.lines().count(), 5 + 5 + 2 * 2);
        let parsed = parse_tx_record(&text).unwrap();
        assert_eq!(parsed, rec);
        assert_eq!(parsed.tx.id(), rec.tx.id());
    }

    #[test]
    fn test_truncated_record_rejected() {
        let rec = sample_block_record();
        let text = format_block_record(&rec);
        let short: String = text.lines().take(5).collect::<Vec<_>>().join("\n");
        assert!(matches!(
            parse_block_record(&short),
            Err(RecordError::Truncated(_))
        ));
    }

    #[test]
    fn test_trailing_content_rejected() {
        let rec = sample_block_record();
        let mut text = format_block_record(&rec);
        text.push_str("extra\n");
        assert!(matches!(
            parse_block_record(&text),
            Err(RecordError::TrailingContent)
        ));
    }

    #[test]
    fn test_corrupt_hash_rejected() {
        let rec = sample_block_record();
        let text = format_block_record(&rec).replacen('a', "z", 1);
        // Only fails when a hash line actually contained the digit.
        if text != format_block_record(&rec) {
            assert!(parse_block_record(&text).is_err());
        }
    }
}
