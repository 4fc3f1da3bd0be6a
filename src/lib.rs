// tinycoin - a minimal proof-of-work ledger node
//
// Layout:
//   core      - blocks, transactions, hashing primitives
//   consensus - proof of work
//   storage   - sled-backed chain store and UTXO index
//   chain     - the Blockchain facade tying the above together
//   wallet    - keys, addresses, transfer construction
//   network   - peer-to-peer protocol and node server
//   cli       - command-line interface

pub mod chain;
pub mod cli;
pub mod consensus;
pub mod core;
pub mod error;
pub mod network;
pub mod storage;
pub mod wallet;

pub use chain::Blockchain;
pub use cli::{Cli, CliHandler};
pub use error::{Error, Result};
