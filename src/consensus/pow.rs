// Proof of work over the block header material

use crate::core::{Block, Hash256, sha256};
use crate::error::{Error, Result};
use log::{debug, info};

/// Fixed protocol difficulty: a winning hash must be below
/// `2^(256 - TARGET_BITS)`. Not adjusted dynamically.
pub const TARGET_BITS: u32 = 15;

/// Upper bound on the nonce search; exhausting it fails the mining attempt.
pub const MAX_NONCE: u64 = u64::MAX;

/// The proof-of-work puzzle at the protocol's fixed target.
pub struct ProofOfWork {
    /// Big-endian bytes of `2^(256 - bits)`.
    target: [u8; 32],
}

impl ProofOfWork {
    pub fn new() -> Self {
        Self {
            target: target_from_bits(TARGET_BITS),
        }
    }

    /// Serialize the header material hashed by the puzzle:
    /// `prev_hash || merkle_root || BE(timestamp) || BE(target_bits) || BE(nonce)`.
    pub fn prepare(block: &Block, nonce: u64) -> Vec<u8> {
        prepare_with_root(block, &block.merkle_root(), nonce)
    }

    /// Search the nonce space and seal the block with the winning
    /// nonce and hash.
    pub fn run(&self, block: &mut Block) -> Result<()> {
        info!("mining block at height {}", block.height);
        let merkle_root = block.merkle_root();

        let mut nonce: u64 = 0;
        loop {
            let data = prepare_with_root(block, &merkle_root, nonce);
            let hash = sha256(&data);

            if self.meets_target(&hash) {
                debug!("found nonce {} -> {}", nonce, hash);
                block.nonce = nonce;
                block.hash = hash;
                return Ok(());
            }

            if nonce == MAX_NONCE {
                return Err(Error::MiningExhausted);
            }
            nonce += 1;
        }
    }

    /// Recompute the hash at the block's stored nonce and check it both
    /// matches the stored hash and meets the target. Used locally before
    /// accepting a mined block and by peers receiving one.
    pub fn validate(&self, block: &Block) -> bool {
        let data = Self::prepare(block, block.nonce);
        let hash = sha256(&data);
        hash == block.hash && self.meets_target(&hash)
    }

    /// Big-endian comparison: the hash read as an unsigned 256-bit
    /// integer must be strictly below the target.
    fn meets_target(&self, hash: &Hash256) -> bool {
        hash.as_bytes()[..] < self.target[..]
    }
}

impl Default for ProofOfWork {
    fn default() -> Self {
        Self::new()
    }
}

fn prepare_with_root(block: &Block, merkle_root: &Hash256, nonce: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(32 + 32 + 8 + 4 + 8);
    data.extend_from_slice(block.prev_hash.as_bytes());
    data.extend_from_slice(merkle_root.as_bytes());
    data.extend_from_slice(&block.timestamp.to_be_bytes());
    data.extend_from_slice(&TARGET_BITS.to_be_bytes());
    data.extend_from_slice(&nonce.to_be_bytes());
    data
}

/// Big-endian bytes of `2^(256 - bits)`, valid for `1 <= bits <= 255`.
fn target_from_bits(bits: u32) -> [u8; 32] {
    debug_assert!((1..=255).contains(&bits));
    let shift = 256 - bits as usize;
    let mut target = [0u8; 32];
    target[31 - shift / 8] = 1 << (shift % 8);
    target
}
