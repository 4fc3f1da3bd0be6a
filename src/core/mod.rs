// Core ledger data structures

mod block;
mod hash;
mod transaction;
mod types;

pub use block::{Block, merkle_root};
pub use hash::{hash160, sha256};
pub use transaction::{
    COINBASE_INDEX, SUBSIDY, Transaction, TxInput, TxKind, TxOutput, TxOutputs,
};
pub use types::Hash256;
