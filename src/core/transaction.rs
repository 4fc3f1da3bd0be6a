// Transaction data structures, id hashing, signing and verification

use crate::core::{Hash256, hash160, sha256};
use crate::error::{Error, Result};
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Reward issued to the miner by a coinbase transaction.
pub const SUBSIDY: u64 = 10;

/// Sentinel output index carried by a coinbase input.
pub const COINBASE_INDEX: u32 = u32::MAX;

/// The two kinds of transaction.
///
/// The serialized layout keeps the classic sentinel encoding (zero previous
/// id, `COINBASE_INDEX`); this enum is derived from it in exactly one place
/// (`Transaction::kind`) so the distinction is never re-inferred from magic
/// values elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    Coinbase,
    Transfer,
}

/// Transaction input - consumes one output of a previous transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Id of the transaction whose output is being spent.
    pub prev_txid: Hash256,
    /// Index of that output.
    pub prev_index: u32,
    /// DER-encoded ECDSA signature; empty until signed.
    pub signature: Vec<u8>,
    /// Compressed SEC public key of the spender. For coinbase inputs this
    /// field carries the miner's memo instead.
    pub public_key: Vec<u8>,
}

impl TxInput {
    pub fn new(prev_txid: Hash256, prev_index: u32, public_key: Vec<u8>) -> Self {
        Self {
            prev_txid,
            prev_index,
            signature: Vec::new(),
            public_key,
        }
    }

    /// Whether this input's key hashes to the given output lock.
    pub fn uses_key(&self, pubkey_hash: &[u8]) -> bool {
        hash160(&self.public_key) == pubkey_hash
    }
}

/// Transaction output - value locked to one recipient's public-key hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    /// 20-byte hash160 of the recipient's public key.
    pub pubkey_hash: Vec<u8>,
}

impl TxOutput {
    pub fn new(value: u64, pubkey_hash: Vec<u8>) -> Self {
        Self { value, pubkey_hash }
    }

    pub fn is_locked_with(&self, pubkey_hash: &[u8]) -> bool {
        self.pubkey_hash == pubkey_hash
    }
}

/// Surviving outputs of one transaction, keyed by their original index.
///
/// The UTXO index stores these per transaction id; keeping the original
/// indices means spend references stay valid after the entry shrinks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutputs {
    pub outputs: Vec<(u32, TxOutput)>,
}

/// A signed value transfer (or a coinbase reward).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Hash of the canonical encoding with this field cleared.
    pub id: Hash256,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Assemble an unsigned transaction and compute its id.
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Result<Self> {
        let mut tx = Self {
            id: Hash256::zero(),
            inputs,
            outputs,
        };
        tx.id = tx.hash()?;
        Ok(tx)
    }

    /// Create the reward transaction for a mined block.
    pub fn new_coinbase(to_pubkey_hash: Vec<u8>, memo: String) -> Result<Self> {
        let input = TxInput {
            prev_txid: Hash256::zero(),
            prev_index: COINBASE_INDEX,
            signature: Vec::new(),
            public_key: memo.into_bytes(),
        };
        let output = TxOutput::new(SUBSIDY, to_pubkey_hash);
        Self::new(vec![input], vec![output])
    }

    pub fn kind(&self) -> TxKind {
        if self.inputs.len() == 1
            && self.inputs[0].prev_txid.is_zero()
            && self.inputs[0].prev_index == COINBASE_INDEX
        {
            TxKind::Coinbase
        } else {
            TxKind::Transfer
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.kind() == TxKind::Coinbase
    }

    /// Hash of the canonical encoding with the id field zeroed.
    pub fn hash(&self) -> Result<Hash256> {
        let mut copy = self.clone();
        copy.id = Hash256::zero();
        let encoded = bincode::serialize(&copy)?;
        Ok(sha256(&encoded))
    }

    pub fn total_output_value(&self) -> u64 {
        self.outputs.iter().map(|out| out.value).sum()
    }

    /// Sign every input with the spender's key.
    ///
    /// The digest for input `i` is the hash of a signature-scrubbed copy in
    /// which input `i`'s key field is replaced by the lock of the output it
    /// spends. That binds each signature to the specific prior output.
    /// Every referenced transaction must be present in `prev_txs`.
    pub fn sign(
        &mut self,
        secret_key: &SecretKey,
        prev_txs: &HashMap<Hash256, Transaction>,
    ) -> Result<()> {
        if self.is_coinbase() {
            return Ok(());
        }

        let secp = Secp256k1::new();
        let mut copy = self.trimmed_copy();

        for i in 0..self.inputs.len() {
            let prev_out = referenced_output(&self.inputs[i], prev_txs)?;
            copy.inputs[i].public_key = prev_out.pubkey_hash.clone();
            let digest = copy.hash()?;
            copy.inputs[i].public_key.clear();

            let message = Message::from_digest_slice(digest.as_bytes())
                .map_err(|e| Error::Validation(format!("bad signing digest: {}", e)))?;
            let signature = secp.sign_ecdsa(&message, secret_key);
            self.inputs[i].signature = signature.serialize_der().to_vec();
        }

        Ok(())
    }

    /// Verify every input signature against the outputs it spends.
    ///
    /// Returns `Ok(false)` for a bad signature or a key that does not match
    /// the referenced output's lock. An unresolved reference is a hard
    /// `NotFound` error, never a soft false.
    pub fn verify(&self, prev_txs: &HashMap<Hash256, Transaction>) -> Result<bool> {
        if self.is_coinbase() {
            return Ok(true);
        }

        let secp = Secp256k1::new();
        let mut copy = self.trimmed_copy();

        for i in 0..self.inputs.len() {
            let input = &self.inputs[i];
            let prev_out = referenced_output(input, prev_txs)?;

            if !prev_out.is_locked_with(&hash160(&input.public_key)) {
                return Ok(false);
            }

            copy.inputs[i].public_key = prev_out.pubkey_hash.clone();
            let digest = copy.hash()?;
            copy.inputs[i].public_key.clear();

            let message = Message::from_digest_slice(digest.as_bytes())
                .map_err(|e| Error::Validation(format!("bad signing digest: {}", e)))?;
            let Ok(signature) = Signature::from_der(&input.signature) else {
                return Ok(false);
            };
            let Ok(public_key) = PublicKey::from_slice(&input.public_key) else {
                return Ok(false);
            };
            if secp.verify_ecdsa(&message, &signature, &public_key).is_err() {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Copy with all signatures and keys cleared, ready for digest
    /// computation.
    fn trimmed_copy(&self) -> Transaction {
        let inputs = self
            .inputs
            .iter()
            .map(|input| TxInput {
                prev_txid: input.prev_txid,
                prev_index: input.prev_index,
                signature: Vec::new(),
                public_key: Vec::new(),
            })
            .collect();

        Transaction {
            id: Hash256::zero(),
            inputs,
            outputs: self.outputs.clone(),
        }
    }
}

fn referenced_output<'a>(
    input: &TxInput,
    prev_txs: &'a HashMap<Hash256, Transaction>,
) -> Result<&'a TxOutput> {
    let prev_tx = prev_txs
        .get(&input.prev_txid)
        .ok_or_else(|| Error::NotFound(format!("referenced transaction {}", input.prev_txid)))?;
    prev_tx
        .outputs
        .get(input.prev_index as usize)
        .ok_or_else(|| {
            Error::Validation(format!(
                "transaction {} has no output {}",
                input.prev_txid, input.prev_index
            ))
        })
}
