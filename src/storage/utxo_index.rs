// Unspent transaction output index backed by sled

use crate::core::{Block, Hash256, TxKind, TxOutput, TxOutputs};
use crate::error::{Error, Result};
use log::debug;
use sled::Tree;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionalTree,
};
use std::collections::HashMap;

/// Mapping from transaction id to that transaction's unspent outputs.
///
/// Each entry keeps the outputs tagged with their original index in the
/// transaction, so references from spending inputs remain valid after an
/// entry shrinks.
pub struct UtxoIndex {
    tree: Tree,
}

impl UtxoIndex {
    pub fn new(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree("utxo")?,
        })
    }

    /// Replace the whole index with a freshly computed output set,
    /// atomically. Used for the initial build and for repair.
    pub fn rebuild(&self, entries: &HashMap<Hash256, TxOutputs>) -> Result<()> {
        let mut encoded = Vec::with_capacity(entries.len());
        for (txid, outputs) in entries {
            encoded.push((txid.as_bytes().to_vec(), bincode::serialize(outputs)?));
        }

        let stale: Vec<sled::IVec> = self
            .tree
            .iter()
            .keys()
            .collect::<std::result::Result<_, sled::Error>>()?;

        self.tree
            .transaction(|t| -> ConflictableTransactionResult<(), Error> {
                for key in &stale {
                    t.remove(key.clone())?;
                }
                for (key, value) in &encoded {
                    t.insert(key.as_slice(), value.clone())?;
                }
                Ok(())
            })
            .map_err(Error::from)?;

        debug!("utxo index rebuilt with {} entries", encoded.len());
        Ok(())
    }

    /// Fold one accepted block into the index: remove the outputs its
    /// transfer inputs consume and add every new output. The whole block
    /// is applied atomically; a spend of an output the index does not
    /// hold aborts the update.
    pub fn apply_block(&self, block: &Block) -> Result<()> {
        self.tree
            .transaction(|t| fold_block(t, block))
            .map_err(Error::from)
    }

    pub(crate) fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Collect unspent outputs locked to `pubkey_hash` until their sum
    /// reaches `amount`. Returns the accumulated value (which may fall
    /// short) and the selected output references grouped by transaction.
    pub fn find_spendable(
        &self,
        pubkey_hash: &[u8],
        amount: u64,
    ) -> Result<(u64, HashMap<Hash256, Vec<u32>>)> {
        let mut accumulated = 0u64;
        let mut selected: HashMap<Hash256, Vec<u32>> = HashMap::new();

        for item in self.tree.iter() {
            let (key, value) = item?;
            let txid = Hash256::from_slice(&key).map_err(Error::Validation)?;
            let entry: TxOutputs = bincode::deserialize(&value)?;

            for (index, output) in &entry.outputs {
                if accumulated >= amount {
                    return Ok((accumulated, selected));
                }
                if output.is_locked_with(pubkey_hash) {
                    accumulated += output.value;
                    selected.entry(txid).or_default().push(*index);
                }
            }
        }

        Ok((accumulated, selected))
    }

    /// All unspent outputs locked to `pubkey_hash`.
    pub fn find_utxo(&self, pubkey_hash: &[u8]) -> Result<Vec<TxOutput>> {
        let mut utxos = Vec::new();

        for item in self.tree.iter() {
            let (_, value) = item?;
            let entry: TxOutputs = bincode::deserialize(&value)?;
            for (_, output) in entry.outputs {
                if output.is_locked_with(pubkey_hash) {
                    utxos.push(output);
                }
            }
        }

        Ok(utxos)
    }

    /// Sum of all unspent output values locked to `pubkey_hash`.
    pub fn balance(&self, pubkey_hash: &[u8]) -> Result<u64> {
        Ok(self
            .find_utxo(pubkey_hash)?
            .iter()
            .map(|output| output.value)
            .sum())
    }

    /// Number of transactions with at least one unspent output.
    pub fn count_entries(&self) -> Result<usize> {
        let mut count = 0;
        for item in self.tree.iter() {
            item?;
            count += 1;
        }
        Ok(count)
    }

    pub fn get(&self, txid: &Hash256) -> Result<Option<TxOutputs>> {
        match self.tree.get(txid.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }
}

/// Transactional body of `apply_block`, shared with the joint
/// block-plus-index commit used by mining.
pub(crate) fn fold_block(
    t: &TransactionalTree,
    block: &Block,
) -> ConflictableTransactionResult<(), Error> {
    for tx in &block.transactions {
        if tx.kind() == TxKind::Transfer {
            for input in &tx.inputs {
                let key = input.prev_txid.as_bytes().as_slice();
                let existing = t.get(key)?.ok_or_else(|| {
                    ConflictableTransactionError::Abort(Error::NotFound(format!(
                        "utxo entry {}",
                        input.prev_txid
                    )))
                })?;
                let entry: TxOutputs = bincode::deserialize(&existing)
                    .map_err(|e| ConflictableTransactionError::Abort(Error::Codec(e)))?;

                let surviving: Vec<(u32, TxOutput)> = entry
                    .outputs
                    .into_iter()
                    .filter(|(index, _)| *index != input.prev_index)
                    .collect();

                if surviving.is_empty() {
                    t.remove(key)?;
                } else {
                    let value = bincode::serialize(&TxOutputs { outputs: surviving })
                        .map_err(|e| ConflictableTransactionError::Abort(Error::Codec(e)))?;
                    t.insert(key, value)?;
                }
            }
        }

        let fresh = TxOutputs {
            outputs: tx
                .outputs
                .iter()
                .cloned()
                .enumerate()
                .map(|(index, output)| (index as u32, output))
                .collect(),
        };
        let value = bincode::serialize(&fresh)
            .map_err(|e| ConflictableTransactionError::Abort(Error::Codec(e)))?;
        t.insert(tx.id.as_bytes().as_slice(), value)?;
    }
    Ok(())
}
