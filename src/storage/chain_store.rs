// Persistent block table backed by sled

use crate::core::{Block, Hash256};
use crate::error::{Error, Result};
use sled::Tree;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionalTree,
};

/// Reserved key holding the hash of the current tip.
const TIP_KEY: &[u8] = b"l";

/// Append-only mapping from block hash to serialized block, plus the tip
/// pointer. Blocks are immutable once stored.
pub struct ChainStore {
    blocks: Tree,
}

impl ChainStore {
    pub fn new(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            blocks: db.open_tree("blocks")?,
        })
    }

    /// Persist a block and advance the tip, atomically.
    ///
    /// Idempotent: a block already present by hash is left untouched. The
    /// tip pointer moves only when the new block's height exceeds the
    /// stored tip's height, so replaying old blocks never rewinds the
    /// chain.
    pub fn put_block(&self, block: &Block) -> Result<()> {
        self.blocks
            .transaction(|t| store_block(t, block))
            .map_err(Error::from)?;
        self.blocks.flush()?;
        Ok(())
    }

    pub(crate) fn tree(&self) -> &Tree {
        &self.blocks
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>> {
        match self.blocks.get(hash.as_bytes())? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, hash: &Hash256) -> Result<bool> {
        Ok(self.blocks.contains_key(hash.as_bytes())?)
    }

    pub fn tip_hash(&self) -> Result<Option<Hash256>> {
        match self.blocks.get(TIP_KEY)? {
            Some(data) => {
                let hash = Hash256::from_slice(&data).map_err(Error::Validation)?;
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    pub fn tip(&self) -> Result<Option<Block>> {
        match self.tip_hash()? {
            Some(hash) => self.get_block(&hash),
            None => Ok(None),
        }
    }

    /// Height of the tip, or `None` for an empty store (a syncing node
    /// may apply network blocks before ever creating a chain locally).
    pub fn best_height(&self) -> Result<Option<u64>> {
        Ok(self.tip()?.map(|block| block.height))
    }

    /// All block hashes, tip to genesis.
    pub fn block_hashes(&self) -> Result<Vec<Hash256>> {
        let mut hashes = Vec::new();
        for block in self.iter() {
            hashes.push(block?.hash);
        }
        Ok(hashes)
    }

    /// Walk the chain backward from the tip to the genesis block.
    pub fn iter(&self) -> ChainIter<'_> {
        ChainIter {
            store: self,
            state: IterState::Start,
        }
    }
}

/// Transactional body of `put_block`, shared with the joint
/// block-plus-index commit used by mining.
pub(crate) fn store_block(
    t: &TransactionalTree,
    block: &Block,
) -> ConflictableTransactionResult<(), Error> {
    let hash = block.hash.as_bytes().as_slice();
    if t.get(hash)?.is_some() {
        return Ok(());
    }
    let encoded = bincode::serialize(block)
        .map_err(|e| ConflictableTransactionError::Abort(Error::Codec(e)))?;
    t.insert(hash, encoded)?;

    let advance = match t.get(TIP_KEY)? {
        None => true,
        Some(tip_hash) => {
            let tip_bytes = t.get(tip_hash.clone())?.ok_or_else(|| {
                ConflictableTransactionError::Abort(Error::NotFound(
                    "tip block missing from chain store".to_string(),
                ))
            })?;
            let tip: Block = bincode::deserialize(&tip_bytes)
                .map_err(|e| ConflictableTransactionError::Abort(Error::Codec(e)))?;
            block.height > tip.height
        }
    };

    if advance {
        t.insert(TIP_KEY, hash)?;
    }
    Ok(())
}

enum IterState {
    Start,
    At(Hash256),
    Done,
}

/// Backward iterator over stored blocks; terminates at the genesis block
/// (zero `prev_hash`).
pub struct ChainIter<'a> {
    store: &'a ChainStore,
    state: IterState,
}

impl Iterator for ChainIter<'_> {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = match self.state {
            IterState::Start => match self.store.tip_hash() {
                Err(e) => {
                    self.state = IterState::Done;
                    return Some(Err(e));
                }
                Ok(None) => {
                    self.state = IterState::Done;
                    return None;
                }
                Ok(Some(hash)) => hash,
            },
            IterState::At(hash) => hash,
            IterState::Done => return None,
        };

        match self.store.get_block(&hash) {
            Err(e) => {
                self.state = IterState::Done;
                Some(Err(e))
            }
            Ok(None) => {
                self.state = IterState::Done;
                Some(Err(Error::NotFound(format!("block {}", hash))))
            }
            Ok(Some(block)) => {
                self.state = if block.prev_hash.is_zero() {
                    IterState::Done
                } else {
                    IterState::At(block.prev_hash)
                };
                Some(Ok(block))
            }
        }
    }
}
