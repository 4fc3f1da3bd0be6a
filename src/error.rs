// Error taxonomy for the node

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A block breaks a consensus rule (bad proof of work, bad linkage).
    #[error("consensus: {0}")]
    Consensus(String),

    /// A transaction or block is well-formed but invalid.
    #[error("validation: {0}")]
    Validation(String),

    /// A referenced block, transaction or output does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage: {0}")]
    Storage(#[from] sled::Error),

    #[error("codec: {0}")]
    Codec(#[from] bincode::Error),

    #[error("network: {0}")]
    Network(#[from] std::io::Error),

    /// A peer sent a frame we cannot understand.
    #[error("protocol: {0}")]
    Protocol(String),

    #[error("wallet: {0}")]
    Wallet(String),

    #[error("mining exhausted the nonce space")]
    MiningExhausted,
}

impl From<sled::transaction::TransactionError<Error>> for Error {
    fn from(err: sled::transaction::TransactionError<Error>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(e) => e,
            sled::transaction::TransactionError::Storage(e) => Error::Storage(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
