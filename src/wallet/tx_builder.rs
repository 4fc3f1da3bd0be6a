// Transfer construction on top of the UTXO index

use crate::chain::Blockchain;
use crate::core::{Transaction, TxInput, TxOutput};
use crate::error::{Error, Result};
use crate::wallet::keystore::{KeyPair, pubkey_hash_from_address};
use log::debug;

/// Build and sign a transfer of `amount` from `keypair`'s address to
/// `to_address`, selecting inputs from the UTXO index and returning any
/// surplus to the sender as change.
pub fn build_transfer(
    chain: &Blockchain,
    keypair: &KeyPair,
    to_address: &str,
    amount: u64,
) -> Result<Transaction> {
    if amount == 0 {
        return Err(Error::Validation("transfer amount must be positive".to_string()));
    }

    let to_pubkey_hash = pubkey_hash_from_address(to_address)?;
    let from_pubkey_hash = keypair.pubkey_hash();
    if to_pubkey_hash == from_pubkey_hash {
        return Err(Error::Validation("sender and recipient are the same".to_string()));
    }

    let (accumulated, spendable) = chain
        .utxo_index()
        .find_spendable(&from_pubkey_hash, amount)?;
    if accumulated < amount {
        return Err(Error::Validation(format!(
            "insufficient funds: have {}, need {}",
            accumulated, amount
        )));
    }
    debug!(
        "selected {} across {} transactions for a {} transfer",
        accumulated,
        spendable.len(),
        amount
    );

    let mut inputs = Vec::new();
    for (txid, indices) in spendable {
        for index in indices {
            inputs.push(TxInput::new(txid, index, keypair.public_key_bytes()));
        }
    }

    let mut outputs = vec![TxOutput::new(amount, to_pubkey_hash)];
    if accumulated > amount {
        outputs.push(TxOutput::new(accumulated - amount, from_pubkey_hash.to_vec()));
    }

    let mut tx = Transaction::new(inputs, outputs)?;
    chain.sign_transaction(&mut tx, keypair.secret_key())?;
    Ok(tx)
}

/// Sum of unspent outputs locked to `address`.
pub fn balance(chain: &Blockchain, address: &str) -> Result<u64> {
    let pubkey_hash = pubkey_hash_from_address(address)?;
    chain.utxo_index().balance(&pubkey_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SUBSIDY;

    fn temp_db() -> sled::Db {
        sled::Config::new().temporary(true).open().unwrap()
    }

    #[test]
    fn test_transfer_with_change() {
        let db = temp_db();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let chain = Blockchain::create(&db, alice.pubkey_hash().to_vec()).unwrap();

        let tx = build_transfer(&chain, &alice, &bob.address(), 4).unwrap();
        assert!(chain.verify_transaction(&tx).unwrap());
        chain.mine_block(vec![tx]).unwrap();

        assert_eq!(balance(&chain, &alice.address()).unwrap(), SUBSIDY - 4);
        assert_eq!(balance(&chain, &bob.address()).unwrap(), 4);
    }

    #[test]
    fn test_exact_spend_has_no_change() {
        let db = temp_db();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let chain = Blockchain::create(&db, alice.pubkey_hash().to_vec()).unwrap();

        let tx = build_transfer(&chain, &alice, &bob.address(), SUBSIDY).unwrap();
        assert_eq!(tx.outputs.len(), 1);
        chain.mine_block(vec![tx]).unwrap();

        assert_eq!(balance(&chain, &alice.address()).unwrap(), 0);
        assert_eq!(balance(&chain, &bob.address()).unwrap(), SUBSIDY);
    }

    #[test]
    fn test_insufficient_funds() {
        let db = temp_db();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let chain = Blockchain::create(&db, alice.pubkey_hash().to_vec()).unwrap();

        let result = build_transfer(&chain, &alice, &bob.address(), SUBSIDY + 1);
        assert!(matches!(result, Err(Error::Validation(_))));

        // Nothing was spent by the failed attempt.
        assert_eq!(balance(&chain, &alice.address()).unwrap(), SUBSIDY);
    }

    #[test]
    fn test_self_transfer_rejected() {
        let db = temp_db();
        let alice = KeyPair::generate();
        let chain = Blockchain::create(&db, alice.pubkey_hash().to_vec()).unwrap();

        assert!(matches!(
            build_transfer(&chain, &alice, &alice.address(), 1),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_zero_amount_rejected() {
        let db = temp_db();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let chain = Blockchain::create(&db, alice.pubkey_hash().to_vec()).unwrap();

        assert!(matches!(
            build_transfer(&chain, &alice, &bob.address(), 0),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_unknown_recipient_address() {
        let db = temp_db();
        let alice = KeyPair::generate();
        let chain = Blockchain::create(&db, alice.pubkey_hash().to_vec()).unwrap();

        assert!(matches!(
            build_transfer(&chain, &alice, "garbage", 1),
            Err(Error::Wallet(_))
        ));
    }
}
