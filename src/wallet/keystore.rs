// Key generation, Base58Check addresses and the on-disk keystore

use crate::core::{hash160, sha256};
use crate::error::{Error, Result};
use log::info;
use rand::rngs::OsRng;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

/// Version byte prefixed to the public-key hash in an address.
pub const ADDRESS_VERSION: u8 = 0x00;

const CHECKSUM_LEN: usize = 4;

/// One secp256k1 key pair controlling funds.
#[derive(Clone)]
pub struct KeyPair {
    secret_key: SecretKey,
    public_key: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::new(&mut OsRng);
        let public_key = secret_key.public_key(&secp);
        Self {
            secret_key,
            public_key,
        }
    }

    fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = secret_key.public_key(&secp);
        Self {
            secret_key,
            public_key,
        }
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    /// Compressed SEC encoding, as carried in transaction inputs.
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public_key.serialize().to_vec()
    }

    pub fn pubkey_hash(&self) -> [u8; 20] {
        hash160(&self.public_key.serialize())
    }

    pub fn address(&self) -> String {
        address_from_pubkey_hash(&self.pubkey_hash())
    }
}

/// Base58Check-encode a public-key hash:
/// `version || pubkey_hash || first 4 bytes of sha256(sha256(version || pubkey_hash))`.
pub fn address_from_pubkey_hash(pubkey_hash: &[u8]) -> String {
    let mut payload = Vec::with_capacity(1 + pubkey_hash.len() + CHECKSUM_LEN);
    payload.push(ADDRESS_VERSION);
    payload.extend_from_slice(pubkey_hash);
    payload.extend_from_slice(&checksum(&payload));
    bs58::encode(payload).into_string()
}

/// Decode an address back to its public-key hash, rejecting a bad
/// version byte or checksum.
pub fn pubkey_hash_from_address(address: &str) -> Result<Vec<u8>> {
    let payload = bs58::decode(address)
        .into_vec()
        .map_err(|e| Error::Wallet(format!("invalid address encoding: {}", e)))?;
    if payload.len() <= 1 + CHECKSUM_LEN {
        return Err(Error::Wallet("address too short".to_string()));
    }

    let (body, stored_checksum) = payload.split_at(payload.len() - CHECKSUM_LEN);
    if checksum(body) != stored_checksum {
        return Err(Error::Wallet("address checksum mismatch".to_string()));
    }
    if body[0] != ADDRESS_VERSION {
        return Err(Error::Wallet(format!(
            "unsupported address version {}",
            body[0]
        )));
    }

    Ok(body[1..].to_vec())
}

pub fn validate_address(address: &str) -> bool {
    pubkey_hash_from_address(address).is_ok()
}

fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = sha256(sha256(payload).as_bytes());
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest.as_bytes()[..CHECKSUM_LEN]);
    out
}

/// JSON file of secret keys, addressed by their Base58Check address.
pub struct Keystore {
    path: PathBuf,
    keys: BTreeMap<String, String>,
}

impl Keystore {
    /// Load the keystore at `path`; a missing file yields an empty one.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let keys = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| Error::Wallet(format!("corrupt keystore: {}", e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(Error::Network(e)),
        };
        Ok(Self { path, keys })
    }

    /// Generate a key pair, persist it, and return its address.
    pub fn create_key(&mut self) -> Result<String> {
        let keypair = KeyPair::generate();
        let address = keypair.address();
        self.keys
            .insert(address.clone(), hex::encode(keypair.secret_key().secret_bytes()));
        self.save()?;
        info!("created key for address {}", address);
        Ok(address)
    }

    pub fn get(&self, address: &str) -> Result<KeyPair> {
        let encoded = self
            .keys
            .get(address)
            .ok_or_else(|| Error::Wallet(format!("no key for address {}", address)))?;
        let bytes = hex::decode(encoded)
            .map_err(|e| Error::Wallet(format!("corrupt keystore entry: {}", e)))?;
        let secret_key = SecretKey::from_slice(&bytes)
            .map_err(|e| Error::Wallet(format!("corrupt keystore entry: {}", e)))?;
        Ok(KeyPair::from_secret_key(secret_key))
    }

    pub fn addresses(&self) -> Vec<String> {
        self.keys.keys().cloned().collect()
    }

    fn save(&self) -> Result<()> {
        let contents = serde_json::to_string_pretty(&self.keys)
            .map_err(|e| Error::Wallet(format!("keystore encode: {}", e)))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, contents)?;
        Ok(())
    }
}
