// Consensus rules

pub mod pow;

pub use pow::{MAX_NONCE, ProofOfWork, TARGET_BITS};
