// Persistence layer

mod chain_store;
mod utxo_index;

pub use chain_store::{ChainIter, ChainStore};
pub use utxo_index::UtxoIndex;

use crate::core::Block;
use crate::error::{Error, Result};
use sled::Transactional;
use sled::transaction::ConflictableTransactionResult;

/// Persist a block and fold it into the UTXO index in one transaction
/// spanning both trees. A crash can never leave the block stored with a
/// stale index, and an index abort (a spend of an untracked output)
/// rolls the block back too.
pub fn commit_block(store: &ChainStore, utxos: &UtxoIndex, block: &Block) -> Result<()> {
    (store.tree(), utxos.tree())
        .transaction(
            |(blocks, utxo)| -> ConflictableTransactionResult<(), Error> {
                chain_store::store_block(blocks, block)?;
                utxo_index::fold_block(utxo, block)?;
                Ok(())
            },
        )
        .map_err(Error::from)?;
    store.tree().flush()?;
    Ok(())
}
