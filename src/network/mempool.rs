// Pending transactions awaiting inclusion in a block

use crate::core::{Hash256, Transaction};
use std::collections::HashMap;

/// Unordered pool of verified-on-arrival transactions, keyed by id.
#[derive(Debug, Default)]
pub struct Mempool {
    txs: HashMap<Hash256, Transaction>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a transaction; returns false if it was already pooled.
    pub fn insert(&mut self, tx: Transaction) -> bool {
        self.txs.insert(tx.id, tx).is_none()
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.txs.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<Transaction> {
        self.txs.get(txid).cloned()
    }

    pub fn remove(&mut self, txid: &Hash256) -> Option<Transaction> {
        self.txs.remove(txid)
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.txs.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }
}
