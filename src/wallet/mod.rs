// Keys, addresses and transaction construction

pub mod keystore;
pub mod tx_builder;

pub use keystore::{
    ADDRESS_VERSION, KeyPair, Keystore, address_from_pubkey_hash, pubkey_hash_from_address,
    validate_address,
};
pub use tx_builder::{balance, build_transfer};
