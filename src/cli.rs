// CLI commands

use crate::chain::Blockchain;
use crate::consensus::ProofOfWork;
use crate::core::Transaction;
use crate::error::{Error, Result};
use crate::network::{NodeConfig, Server, send_transaction};
use crate::wallet::{Keystore, build_transfer, pubkey_hash_from_address, validate_address};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_NODE_ADDR: &str = "127.0.0.1:3000";

#[derive(Parser)]
#[command(name = "tinycoin")]
#[command(about = "Minimal proof-of-work ledger node", long_about = None)]
pub struct Cli {
    /// Data directory holding the chain database and keystore
    #[arg(long, global = true, default_value = "./data")]
    pub data_dir: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a new chain, paying the genesis reward to an address
    Init {
        /// Address receiving the genesis subsidy
        address: String,
    },

    /// Wallet commands
    #[command(subcommand)]
    Wallet(WalletCommands),

    /// Show the balance of an address
    Balance {
        address: String,
    },

    /// Send coins from one owned address to another address
    Send {
        /// Sender address (its key must be in the keystore)
        from: String,
        /// Recipient address
        to: String,
        /// Amount to transfer
        amount: u64,
        /// Mine the transaction locally instead of handing it to a node
        #[arg(long)]
        mine: bool,
        /// Node to submit the transaction to
        #[arg(long, default_value = DEFAULT_NODE_ADDR)]
        node: String,
    },

    /// Print every block, tip to genesis
    PrintChain,

    /// Rebuild the unspent-output index from the chain
    ReindexUtxo,

    /// Run the peer-to-peer node
    StartNode {
        /// Listen address
        #[arg(long, default_value = DEFAULT_NODE_ADDR)]
        addr: String,
        /// Well-known node contacted on startup
        #[arg(long, default_value = DEFAULT_NODE_ADDR)]
        bootstrap: String,
        /// Mine pooled transactions, collecting rewards at this address
        #[arg(long)]
        miner: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum WalletCommands {
    /// Create a new address
    NewAddress,

    /// List all addresses
    List,

    /// Check whether an address is well-formed
    Validate {
        address: String,
    },
}

pub struct CliHandler {
    data_dir: PathBuf,
}

impl CliHandler {
    pub fn new(data_dir: &str) -> Self {
        Self {
            data_dir: PathBuf::from(data_dir),
        }
    }

    pub fn handle(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Init { address } => self.init(&address),
            Commands::Wallet(cmd) => self.handle_wallet(cmd),
            Commands::Balance { address } => self.balance(&address),
            Commands::Send {
                from,
                to,
                amount,
                mine,
                node,
            } => self.send(&from, &to, amount, mine, &node),
            Commands::PrintChain => self.print_chain(),
            Commands::ReindexUtxo => self.reindex_utxo(),
            Commands::StartNode {
                addr,
                bootstrap,
                miner,
            } => self.start_node(addr, bootstrap, miner),
        }
    }

    fn open_db(&self) -> Result<sled::Db> {
        Ok(sled::open(self.data_dir.join("chain"))?)
    }

    fn keystore(&self) -> Result<Keystore> {
        Keystore::load(self.data_dir.join("keystore.json"))
    }

    fn init(&self, address: &str) -> Result<()> {
        let pubkey_hash = pubkey_hash_from_address(address)?;
        let db = self.open_db()?;
        let chain = Blockchain::create(&db, pubkey_hash)?;

        let tip = chain
            .tip_hash()?
            .ok_or_else(|| Error::NotFound("chain tip".to_string()))?;
        println!("Chain created; genesis block {}", tip);
        Ok(())
    }

    fn handle_wallet(&self, command: WalletCommands) -> Result<()> {
        match command {
            WalletCommands::NewAddress => {
                let mut keystore = self.keystore()?;
                let address = keystore.create_key()?;
                println!("{}", address);
            }
            WalletCommands::List => {
                for address in self.keystore()?.addresses() {
                    println!("{}", address);
                }
            }
            WalletCommands::Validate { address } => {
                if validate_address(&address) {
                    println!("valid");
                } else {
                    println!("invalid");
                }
            }
        }
        Ok(())
    }

    fn balance(&self, address: &str) -> Result<()> {
        let db = self.open_db()?;
        let chain = Blockchain::open(&db)?;
        let balance = crate::wallet::balance(&chain, address)?;
        println!("Balance of {}: {}", address, balance);
        Ok(())
    }

    fn send(&self, from: &str, to: &str, amount: u64, mine: bool, node: &str) -> Result<()> {
        let keystore = self.keystore()?;
        let keypair = keystore.get(from)?;

        let db = self.open_db()?;
        let chain = Blockchain::open(&db)?;
        let tx = build_transfer(&chain, &keypair, to, amount)?;

        if mine {
            // Local mining also collects the block reward for the sender.
            let coinbase =
                Transaction::new_coinbase(keypair.pubkey_hash().to_vec(), format!("Reward to '{}'", from))?;
            let block = chain.mine_block(vec![coinbase, tx])?;
            println!("Sent {} to {}; mined block {}", amount, to, block.hash);
        } else {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(send_transaction(node, "cli", &tx))?;
            println!("Sent {} to {}; transaction {} submitted to {}", amount, to, tx.id, node);
        }
        Ok(())
    }

    fn print_chain(&self) -> Result<()> {
        let db = self.open_db()?;
        let chain = Blockchain::open(&db)?;
        let pow = ProofOfWork::new();

        for block in chain.iter() {
            let block = block?;
            println!("============ Block {} ============", block.hash);
            println!("Height:    {}", block.height);
            println!("Prev:      {}", block.prev_hash);
            println!("Timestamp: {}", block.timestamp);
            println!("Nonce:     {}", block.nonce);
            println!("PoW:       {}", pow.validate(&block));
            for tx in &block.transactions {
                println!("  tx {} ({:?})", tx.id, tx.kind());
            }
            println!();
        }
        Ok(())
    }

    fn reindex_utxo(&self) -> Result<()> {
        let db = self.open_db()?;
        let chain = Blockchain::open(&db)?;
        let entries = chain.reindex_utxo()?;
        println!("Done; {} transactions in the UTXO index", entries);
        Ok(())
    }

    fn start_node(&self, addr: String, bootstrap: String, miner: Option<String>) -> Result<()> {
        if let Some(miner_address) = &miner {
            if !validate_address(miner_address) {
                return Err(Error::Wallet(format!("invalid miner address {}", miner_address)));
            }
            println!("Mining enabled; rewards go to {}", miner_address);
        }

        let db = self.open_db()?;
        let chain = Arc::new(Blockchain::open(&db)?);
        let server = Server::new(
            NodeConfig {
                addr,
                bootstrap_addr: bootstrap,
                miner_address: miner,
            },
            chain,
        );

        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(server.run())
    }
}
