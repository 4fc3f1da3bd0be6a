// Blockchain facade over the chain store, UTXO index and consensus rules

use crate::consensus::ProofOfWork;
use crate::core::{Block, Hash256, Transaction, TxKind, TxOutputs};
use crate::error::{Error, Result};
use crate::storage::{ChainIter, ChainStore, UtxoIndex, commit_block};
use log::info;
use secp256k1::SecretKey;
use std::collections::{HashMap, HashSet};

/// Memo embedded in the genesis coinbase.
const GENESIS_MEMO: &str = "The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";

/// The node's view of the ledger: persistent block storage plus the
/// unspent-output index, with consensus checks applied on every write.
pub struct Blockchain {
    store: ChainStore,
    utxos: UtxoIndex,
}

impl Blockchain {
    /// Create a brand-new chain: mine the genesis block paying its
    /// subsidy to `genesis_pubkey_hash` and build the UTXO index.
    /// Fails if the database already holds a chain.
    pub fn create(db: &sled::Db, genesis_pubkey_hash: Vec<u8>) -> Result<Self> {
        let store = ChainStore::new(db)?;
        if store.tip_hash()?.is_some() {
            return Err(Error::Validation("chain already exists".to_string()));
        }

        let coinbase = Transaction::new_coinbase(genesis_pubkey_hash, GENESIS_MEMO.to_string())?;
        let mut genesis = Block::genesis(coinbase);
        ProofOfWork::new().run(&mut genesis)?;
        store.put_block(&genesis)?;
        info!("created chain with genesis block {}", genesis.hash);

        let chain = Self {
            store,
            utxos: UtxoIndex::new(db)?,
        };
        chain.reindex_utxo()?;
        Ok(chain)
    }

    /// Open an existing database. An empty one is accepted: a syncing
    /// node starts with no blocks and fills the store from its peers.
    pub fn open(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            store: ChainStore::new(db)?,
            utxos: UtxoIndex::new(db)?,
        })
    }

    /// Mine a block carrying `transactions` on top of the current tip.
    ///
    /// Every transaction is verified first; an invalid one fails the
    /// whole attempt. The sealed block and the matching UTXO index
    /// update are committed in one storage transaction.
    pub fn mine_block(&self, transactions: Vec<Transaction>) -> Result<Block> {
        for tx in &transactions {
            if !self.verify_transaction(tx)? {
                return Err(Error::Validation(format!("invalid transaction {}", tx.id)));
            }
        }

        let tip = self
            .store
            .tip()?
            .ok_or_else(|| Error::NotFound("chain tip".to_string()))?;

        let mut block = Block::new(transactions, tip.hash, tip.height + 1);
        ProofOfWork::new().run(&mut block)?;

        commit_block(&self.store, &self.utxos, &block)?;
        info!("mined block {} at height {}", block.hash, block.height);
        Ok(block)
    }

    /// Accept a block received from a peer. The proof of work is checked
    /// here; the UTXO index is rebuilt separately once a sync batch
    /// completes, since blocks may arrive out of order.
    pub fn add_block(&self, block: &Block) -> Result<()> {
        if !ProofOfWork::new().validate(block) {
            return Err(Error::Consensus(format!(
                "block {} fails proof of work",
                block.hash
            )));
        }
        self.store.put_block(block)?;
        Ok(())
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>> {
        self.store.get_block(hash)
    }

    pub fn contains_block(&self, hash: &Hash256) -> Result<bool> {
        self.store.contains(hash)
    }

    pub fn tip_hash(&self) -> Result<Option<Hash256>> {
        self.store.tip_hash()
    }

    pub fn best_height(&self) -> Result<Option<u64>> {
        self.store.best_height()
    }

    /// All block hashes, tip to genesis.
    pub fn block_hashes(&self) -> Result<Vec<Hash256>> {
        self.store.block_hashes()
    }

    pub fn iter(&self) -> ChainIter<'_> {
        self.store.iter()
    }

    pub fn utxo_index(&self) -> &UtxoIndex {
        &self.utxos
    }

    /// Locate a mined transaction by id.
    pub fn find_transaction(&self, txid: &Hash256) -> Result<Transaction> {
        for block in self.store.iter() {
            for tx in block?.transactions {
                if tx.id == *txid {
                    return Ok(tx);
                }
            }
        }
        Err(Error::NotFound(format!("transaction {}", txid)))
    }

    /// Sign a transaction's inputs against the mined transactions they
    /// reference.
    pub fn sign_transaction(&self, tx: &mut Transaction, secret_key: &SecretKey) -> Result<()> {
        let prev_txs = self.referenced_transactions(tx)?;
        tx.sign(secret_key, &prev_txs)?;
        tx.id = tx.hash()?;
        Ok(())
    }

    /// Full validity check for a transaction against the current chain.
    ///
    /// `Ok(false)` covers bad signatures, mismatched locks and inputs
    /// already consumed by a mined transaction. A reference to a
    /// transaction the chain has never seen is a hard `NotFound` error.
    pub fn verify_transaction(&self, tx: &Transaction) -> Result<bool> {
        if tx.is_coinbase() {
            return Ok(true);
        }
        if self.spends_consumed_output(tx)? {
            return Ok(false);
        }
        let prev_txs = self.referenced_transactions(tx)?;
        tx.verify(&prev_txs)
    }

    /// Recompute the full unspent-output set from the chain and replace
    /// the index with it. Returns the number of indexed transactions.
    pub fn reindex_utxo(&self) -> Result<usize> {
        let entries = self.find_all_utxo()?;
        self.utxos.rebuild(&entries)?;
        self.utxos.count_entries()
    }

    /// Walk the whole chain and collect every output not consumed by a
    /// later transaction.
    pub fn find_all_utxo(&self) -> Result<HashMap<Hash256, TxOutputs>> {
        let mut unspent: HashMap<Hash256, TxOutputs> = HashMap::new();
        let mut spent: HashMap<Hash256, Vec<u32>> = HashMap::new();

        // Tip-to-genesis iteration guarantees spends are recorded before
        // the outputs they consume are visited; within a block the
        // transactions are walked in reverse for the same reason.
        for block in self.store.iter() {
            for tx in block?.transactions.iter().rev() {
                for (index, output) in tx.outputs.iter().enumerate() {
                    let index = index as u32;
                    let consumed = spent
                        .get(&tx.id)
                        .is_some_and(|indices| indices.contains(&index));
                    if !consumed {
                        unspent
                            .entry(tx.id)
                            .or_default()
                            .outputs
                            .push((index, output.clone()));
                    }
                }

                if tx.kind() == TxKind::Transfer {
                    for input in &tx.inputs {
                        spent
                            .entry(input.prev_txid)
                            .or_default()
                            .push(input.prev_index);
                    }
                }
            }
        }

        Ok(unspent)
    }

    /// Whether any input of `tx` duplicates another of its inputs or an
    /// input of a transaction already mined into the chain.
    fn spends_consumed_output(&self, tx: &Transaction) -> Result<bool> {
        let mut claimed: HashSet<(Hash256, u32)> = HashSet::new();
        for input in &tx.inputs {
            if !claimed.insert((input.prev_txid, input.prev_index)) {
                return Ok(true);
            }
        }

        for block in self.store.iter() {
            for mined in &block?.transactions {
                if mined.kind() != TxKind::Transfer || mined.id == tx.id {
                    continue;
                }
                for input in &mined.inputs {
                    if claimed.contains(&(input.prev_txid, input.prev_index)) {
                        return Ok(true);
                    }
                }
            }
        }

        Ok(false)
    }

    fn referenced_transactions(
        &self,
        tx: &Transaction,
    ) -> Result<HashMap<Hash256, Transaction>> {
        let mut wanted: HashSet<Hash256> =
            tx.inputs.iter().map(|input| input.prev_txid).collect();
        let mut found = HashMap::new();

        for block in self.store.iter() {
            for candidate in block?.transactions {
                if wanted.remove(&candidate.id) {
                    found.insert(candidate.id, candidate);
                }
            }
            if wanted.is_empty() {
                break;
            }
        }

        if let Some(missing) = wanted.into_iter().next() {
            return Err(Error::NotFound(format!("referenced transaction {}", missing)));
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{SUBSIDY, TxInput, TxOutput, hash160};
    use rand::rngs::OsRng;
    use secp256k1::Secp256k1;

    fn temp_db() -> sled::Db {
        sled::Config::new().temporary(true).open().unwrap()
    }

    struct Account {
        secret_key: SecretKey,
        public_key: Vec<u8>,
        pubkey_hash: Vec<u8>,
    }

    fn account() -> Account {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::new(&mut OsRng);
        let public_key = secret_key.public_key(&secp).serialize().to_vec();
        let pubkey_hash = hash160(&public_key).to_vec();
        Account {
            secret_key,
            public_key,
            pubkey_hash,
        }
    }

    /// Build and sign a transfer using the UTXO index for coin selection.
    fn transfer(chain: &Blockchain, from: &Account, to: &Account, amount: u64) -> Transaction {
        let (accumulated, spendable) = chain
            .utxo_index()
            .find_spendable(&from.pubkey_hash, amount)
            .unwrap();
        assert!(accumulated >= amount, "test account underfunded");

        let mut inputs = Vec::new();
        for (txid, indices) in spendable {
            for index in indices {
                inputs.push(TxInput::new(txid, index, from.public_key.clone()));
            }
        }

        let mut outputs = vec![TxOutput::new(amount, to.pubkey_hash.clone())];
        if accumulated > amount {
            outputs.push(TxOutput::new(accumulated - amount, from.pubkey_hash.clone()));
        }

        let mut tx = Transaction::new(inputs, outputs).unwrap();
        chain.sign_transaction(&mut tx, &from.secret_key).unwrap();
        tx
    }

    #[test]
    fn test_create_pays_genesis_subsidy() {
        let db = temp_db();
        let miner = account();
        let chain = Blockchain::create(&db, miner.pubkey_hash.clone()).unwrap();

        assert_eq!(chain.best_height().unwrap(), Some(0));
        assert_eq!(chain.utxo_index().balance(&miner.pubkey_hash).unwrap(), SUBSIDY);
    }

    #[test]
    fn test_create_refuses_existing_chain() {
        let db = temp_db();
        let miner = account();
        let _chain = Blockchain::create(&db, miner.pubkey_hash.clone()).unwrap();

        assert!(matches!(
            Blockchain::create(&db, miner.pubkey_hash.clone()),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_open_empty_database() {
        let db = temp_db();
        let chain = Blockchain::open(&db).unwrap();
        assert_eq!(chain.best_height().unwrap(), None);
    }

    #[test]
    fn test_transfer_updates_balances() {
        let db = temp_db();
        let alice = account();
        let bob = account();
        let chain = Blockchain::create(&db, alice.pubkey_hash.clone()).unwrap();

        let tx = transfer(&chain, &alice, &bob, 4);
        chain.mine_block(vec![tx]).unwrap();

        assert_eq!(chain.best_height().unwrap(), Some(1));
        assert_eq!(chain.utxo_index().balance(&alice.pubkey_hash).unwrap(), SUBSIDY - 4);
        assert_eq!(chain.utxo_index().balance(&bob.pubkey_hash).unwrap(), 4);
    }

    #[test]
    fn test_double_spend_fails_verification() {
        let db = temp_db();
        let alice = account();
        let bob = account();
        let chain = Blockchain::create(&db, alice.pubkey_hash.clone()).unwrap();

        // Both transactions spend the genesis coinbase output.
        let first = transfer(&chain, &alice, &bob, 4);
        let mut second = Transaction::new(
            vec![TxInput::new(
                first.inputs[0].prev_txid,
                first.inputs[0].prev_index,
                alice.public_key.clone(),
            )],
            vec![TxOutput::new(SUBSIDY, alice.pubkey_hash.clone())],
        )
        .unwrap();
        chain.sign_transaction(&mut second, &alice.secret_key).unwrap();

        assert!(chain.verify_transaction(&first).unwrap());
        assert!(chain.verify_transaction(&second).unwrap());

        chain.mine_block(vec![first]).unwrap();
        assert!(!chain.verify_transaction(&second).unwrap());
    }

    #[test]
    fn test_mining_invalid_transaction_fails() {
        let db = temp_db();
        let alice = account();
        let mallory = account();
        let chain = Blockchain::create(&db, alice.pubkey_hash.clone()).unwrap();

        // Mallory claims Alice's output with her own key, unsigned.
        let genesis_coinbase = chain.iter().next().unwrap().unwrap().transactions[0].clone();
        let theft = Transaction::new(
            vec![TxInput::new(genesis_coinbase.id, 0, mallory.public_key.clone())],
            vec![TxOutput::new(SUBSIDY, mallory.pubkey_hash.clone())],
        )
        .unwrap();

        assert!(matches!(
            chain.mine_block(vec![theft]),
            Err(Error::Validation(_))
        ));
        // Failed attempt leaves the chain untouched.
        assert_eq!(chain.best_height().unwrap(), Some(0));
        assert_eq!(chain.utxo_index().balance(&alice.pubkey_hash).unwrap(), SUBSIDY);
    }

    #[test]
    fn test_unknown_reference_is_hard_error() {
        let db = temp_db();
        let alice = account();
        let chain = Blockchain::create(&db, alice.pubkey_hash.clone()).unwrap();

        let phantom = Transaction::new(
            vec![TxInput::new(Hash256::new([0xee; 32]), 0, alice.public_key.clone())],
            vec![TxOutput::new(1, alice.pubkey_hash.clone())],
        )
        .unwrap();

        assert!(matches!(
            chain.verify_transaction(&phantom),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_reindex_matches_incremental_index() {
        let db = temp_db();
        let alice = account();
        let bob = account();
        let chain = Blockchain::create(&db, alice.pubkey_hash.clone()).unwrap();

        let tx = transfer(&chain, &alice, &bob, 3);
        chain.mine_block(vec![tx]).unwrap();
        let tx = transfer(&chain, &bob, &alice, 1);
        chain.mine_block(vec![tx]).unwrap();

        let alice_before = chain.utxo_index().balance(&alice.pubkey_hash).unwrap();
        let bob_before = chain.utxo_index().balance(&bob.pubkey_hash).unwrap();
        let entries_before = chain.utxo_index().count_entries().unwrap();

        let entries_after = chain.reindex_utxo().unwrap();

        assert_eq!(entries_after, entries_before);
        assert_eq!(chain.utxo_index().balance(&alice.pubkey_hash).unwrap(), alice_before);
        assert_eq!(chain.utxo_index().balance(&bob.pubkey_hash).unwrap(), bob_before);
        assert_eq!(alice_before + bob_before, SUBSIDY);
    }

    #[test]
    fn test_add_block_rejects_bad_proof_of_work() {
        let db = temp_db();
        let alice = account();
        let chain = Blockchain::create(&db, alice.pubkey_hash.clone()).unwrap();

        let tip = chain.iter().next().unwrap().unwrap();
        let coinbase = Transaction::new_coinbase(alice.pubkey_hash.clone(), String::new()).unwrap();
        let forged = Block::new(vec![coinbase], tip.hash, tip.height + 1);

        assert!(matches!(
            chain.add_block(&forged),
            Err(Error::Consensus(_))
        ));
    }

    #[test]
    fn test_find_transaction() {
        let db = temp_db();
        let alice = account();
        let chain = Blockchain::create(&db, alice.pubkey_hash.clone()).unwrap();

        let genesis_coinbase = chain.iter().next().unwrap().unwrap().transactions[0].clone();
        let found = chain.find_transaction(&genesis_coinbase.id).unwrap();
        assert_eq!(found, genesis_coinbase);

        assert!(matches!(
            chain.find_transaction(&Hash256::new([0x42; 32])),
            Err(Error::NotFound(_))
        ));
    }
}
