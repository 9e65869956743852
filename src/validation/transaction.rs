//! Transaction structure and signing
//!
//! UTXO-based transactions with ECDSA signatures. A transaction's identity
//! is the double hash of its canonical encoding; signatures cover only
//! `(min_block, outputs)` so inputs can be assembled after signing.

use crate::codec::{
    expect_end, get_bool, get_bytes, get_hash, get_u64, put_bool, put_bytes, put_hash, put_u64,
    WireError,
};
use crate::crypto::{double_hash, EcdsaSignature, Hash, PrivateKey, PublicKey};
use crate::crypto::{PUBLIC_KEY_LEN, SIGNATURE_LEN};

/// A reference to a spendable output. The value is carried redundantly so
/// verifiers can cross-check it against the origin output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Utxo {
    /// Transaction that produced the output.
    pub tx_id: Hash,
    /// Index of the output in that transaction.
    pub index: u64,
    /// Claimed value of the output.
    pub value: u64,
}

/// A transaction input spending a previous output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    /// The output being consumed.
    pub utxo: Utxo,
    /// Public key whose hash the output committed to.
    pub public_key: PublicKey,
    /// Signature over the transaction's pre-signature hash.
    pub signature: EcdsaSignature,
}

/// A transaction output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOut {
    /// Amount in base units.
    pub value: u64,
    /// BLAKE3 hash of the recipient's public key.
    pub pubkey_hash: Hash,
}

/// A complete transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tx {
    /// Coinbase transactions mint the block reward and carry no inputs.
    pub is_coinbase: bool,
    /// Earliest block height this transaction may be included at.
    pub min_block: u64,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
}

impl Tx {
    /// Smallest possible encoding: flag, min_block and two empty arrays.
    pub const MIN_VSIZE: u64 = 25;

    /// Create a coinbase transaction minting `value` at height `min_block`.
    pub fn coinbase(value: u64, min_block: u64, pubkey_hash: Hash) -> Self {
        Self {
            is_coinbase: true,
            min_block,
            inputs: vec![],
            outputs: vec![TxOut { value, pubkey_hash }],
        }
    }

    /// Content identity: double hash of the canonical encoding.
    pub fn id(&self) -> Hash {
        double_hash(&self.encode())
    }

    /// Byte-accounting size: the canonical encoding length.
    pub fn vsize(&self) -> u64 {
        self.encode().len() as u64
    }

    /// The digest every input signature must cover.
    pub fn sig_hash(&self) -> Hash {
        sig_hash(self.min_block, &self.outputs)
    }

    /// Sum of the values claimed by the inputs.
    pub fn total_input_value(&self) -> u64 {
        self.inputs.iter().map(|input| input.utxo.value).sum()
    }

    /// Sum of the output values.
    pub fn total_output_value(&self) -> u64 {
        self.outputs.iter().map(|output| output.value).sum()
    }

    /// Miner fee: inputs minus outputs.
    pub fn fee(&self) -> u64 {
        self.total_input_value()
            .saturating_sub(self.total_output_value())
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        put_bool(buf, self.is_coinbase);
        put_u64(buf, self.min_block);
        put_u64(buf, self.inputs.len() as u64);
        for input in &self.inputs {
            put_hash(buf, &input.utxo.tx_id);
            put_u64(buf, input.utxo.index);
            put_u64(buf, input.utxo.value);
            put_bytes(buf, &input.public_key.0);
            put_bytes(buf, &input.signature.0);
        }
        put_u64(buf, self.outputs.len() as u64);
        for output in &self.outputs {
            put_u64(buf, output.value);
            put_hash(buf, &output.pubkey_hash);
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    pub fn decode(input: &mut &[u8]) -> Result<Self, WireError> {
        let is_coinbase = get_bool(input)?;
        let min_block = get_u64(input)?;

        let input_count = get_u64(input)?;
        let mut inputs = Vec::with_capacity(input_count.min(1024) as usize);
        for _ in 0..input_count {
            let tx_id = get_hash(input)?;
            let index = get_u64(input)?;
            let value = get_u64(input)?;
            let key_bytes = get_bytes(input)?;
            let key: [u8; PUBLIC_KEY_LEN] =
                key_bytes.try_into().map_err(|_| WireError::BadKeyLength)?;
            let sig_bytes = get_bytes(input)?;
            let sig: [u8; SIGNATURE_LEN] = sig_bytes
                .try_into()
                .map_err(|_| WireError::BadSignatureLength)?;
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

        let output_count = get_u64(input)?;
        let mut outputs = Vec::with_capacity(output_count.min(1024) as usize);
        for _ in 0..output_count {
            let value = get_u64(input)?;
            let pubkey_hash = get_hash(input)?;
            outputs.push(TxOut { value, pubkey_hash });
        }

        Ok(Self {
            is_coinbase,
            min_block,
            inputs,
            outputs,
        })
    }

    /// Decode a transaction that must occupy the whole input.
    pub fn decode_exact(mut input: &[u8]) -> Result<Self, WireError> {
        let tx = Self::decode(&mut input)?;
        expect_end(input)?;
        Ok(tx)
    }
}

/// Pre-signature hash over `(min_block, outputs)`.
///
/// Inputs are excluded so a signature can be produced before the inputs
/// that carry it are assembled.
pub fn sig_hash(min_block: u64, outputs: &[TxOut]) -> Hash {
    let mut buf = Vec::new();
    put_u64(&mut buf, min_block);
    put_u64(&mut buf, outputs.len() as u64);
    for output in outputs {
        put_u64(&mut buf, output.value);
        put_hash(&mut buf, &output.pubkey_hash);
    }
    double_hash(&buf)
}

/// Build a signed input spending `utxo` with `key`.
pub fn signed_input(utxo: Utxo, key: &PrivateKey, digest: &Hash) -> TxIn {
    TxIn {
        utxo,
        public_key: key.public_key(),
        signature: key.sign(digest),
    }
}
