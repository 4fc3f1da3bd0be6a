// Block data structure and Merkle digest

use crate::core::{Hash256, Transaction, sha256};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// One block of the append-only chain.
///
/// `hash` and `nonce` are zero until the proof-of-work seals the block;
/// after that the block is immutable and owned by the chain store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Creation time, UTC seconds.
    pub timestamp: i64,
    /// At least one transaction; the first may be a coinbase.
    pub transactions: Vec<Transaction>,
    /// Parent hash; the zero hash only for the genesis block.
    pub prev_hash: Hash256,
    /// Derived by the proof-of-work over the header material.
    pub hash: Hash256,
    /// Proof that the PoW condition holds.
    pub nonce: u64,
    /// Parent height + 1; genesis is 0.
    pub height: u64,
}

impl Block {
    /// Assemble an unsealed candidate block.
    pub fn new(transactions: Vec<Transaction>, prev_hash: Hash256, height: u64) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        Self {
            timestamp,
            transactions,
            prev_hash,
            hash: Hash256::zero(),
            nonce: 0,
            height,
        }
    }

    /// Unsealed genesis candidate carrying a single coinbase transaction.
    pub fn genesis(coinbase: Transaction) -> Self {
        Self::new(vec![coinbase], Hash256::zero(), 0)
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_zero()
    }

    /// Merkle root over the block's transaction ids.
    ///
    /// Pairwise concatenation-hash tree; an odd node is paired with itself.
    pub fn merkle_root(&self) -> Hash256 {
        merkle_root(&self.transactions)
    }
}

/// Compute the Merkle root of an ordered set of transactions.
pub fn merkle_root(transactions: &[Transaction]) -> Hash256 {
    if transactions.is_empty() {
        return Hash256::zero();
    }

    let mut hashes: Vec<Hash256> = transactions.iter().map(|tx| tx.id).collect();

    while hashes.len() > 1 {
        let mut next_level = Vec::with_capacity(hashes.len().div_ceil(2));

        for chunk in hashes.chunks(2) {
            let left = chunk[0];
            let right = if chunk.len() == 2 { chunk[1] } else { chunk[0] };

            let mut combined = Vec::with_capacity(64);
            combined.extend_from_slice(left.as_bytes());
            combined.extend_from_slice(right.as_bytes());
            next_level.push(sha256(&combined));
        }

        hashes = next_level;
    }

    hashes[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coinbase(memo: &str) -> Transaction {
        Transaction::new_coinbase(vec![1u8; 20], memo.to_string()).unwrap()
    }

    #[test]
    fn test_genesis_block() {
        let block = Block::genesis(coinbase("genesis"));
        assert!(block.is_genesis());
        assert_eq!(block.height, 0);
        assert_eq!(block.transactions.len(), 1);
        assert!(block.transactions[0].is_coinbase());
    }

    #[test]
    fn test_merkle_root_single_tx() {
        let tx = coinbase("only");
        let root = merkle_root(&[tx.clone()]);
        assert_eq!(root, tx.id);
    }

    #[test]
    fn test_merkle_root_order_sensitive() {
        let a = coinbase("a");
        let b = coinbase("b");

        let forward = merkle_root(&[a.clone(), b.clone()]);
        let backward = merkle_root(&[b, a]);
        assert_ne!(forward, backward);
    }

    #[test]
    fn test_merkle_root_odd_count() {
        let txs = vec![coinbase("a"), coinbase("b"), coinbase("c")];
        let root = merkle_root(&txs);
        assert!(!root.is_zero());
        // Deterministic for the same ordered set.
        assert_eq!(root, merkle_root(&txs));
    }

    #[test]
    fn test_block_serialization_round_trip() {
        let block = Block::genesis(coinbase("round trip"));
        let encoded = bincode::serialize(&block).unwrap();
        let decoded: Block = bincode::deserialize(&encoded).unwrap();
        assert_eq!(block, decoded);
    }
}
