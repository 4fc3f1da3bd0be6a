// Peer-to-peer node: TCP listener, message handlers and mining loop

use crate::chain::Blockchain;
use crate::core::{Hash256, Transaction};
use crate::error::{Error, Result};
use crate::network::mempool::Mempool;
use crate::network::message::{
    AddrPayload, BlockPayload, GetBlocksPayload, GetDataPayload, InvKind, InvPayload, Message,
    PROTOCOL_VERSION, TxPayload, VersionPayload,
};
use crate::wallet::pubkey_hash_from_address;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Semaphore};

/// Cap on concurrently handled inbound connections.
const MAX_CONNECTIONS: usize = 64;

/// A peer that stalls past this while sending a frame is dropped.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// A mining node starts a block once this many transactions are pooled.
const MINE_THRESHOLD: usize = 2;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address this node listens on and advertises to peers.
    pub addr: String,
    /// Well-known node contacted on startup. A node whose own address
    /// equals this one acts as the hub and forwards announcements.
    pub bootstrap_addr: String,
    /// When set, this node mines pooled transactions and collects the
    /// rewards at this address.
    pub miner_address: Option<String>,
}

/// Mutable node state shared across connection handlers.
struct NodeState {
    known_peers: Vec<String>,
    /// Announced block hashes not yet requested.
    blocks_in_transit: Vec<Hash256>,
    mempool: Mempool,
}

pub struct Server {
    config: NodeConfig,
    chain: Arc<Blockchain>,
    state: Mutex<NodeState>,
    connections: Arc<Semaphore>,
}

impl Server {
    pub fn new(config: NodeConfig, chain: Arc<Blockchain>) -> Arc<Self> {
        let known_peers = if config.addr == config.bootstrap_addr {
            Vec::new()
        } else {
            vec![config.bootstrap_addr.clone()]
        };

        Arc::new(Self {
            config,
            chain,
            state: Mutex::new(NodeState {
                known_peers,
                blocks_in_transit: Vec::new(),
                mempool: Mempool::new(),
            }),
            connections: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        })
    }

    pub fn chain(&self) -> &Blockchain {
        &self.chain
    }

    pub async fn mempool_len(&self) -> usize {
        self.state.lock().await.mempool.len()
    }

    /// Bind the listener, announce ourselves to the bootstrap node, and
    /// serve connections until the task is cancelled.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.addr).await?;
        info!("node listening on {}", self.config.addr);

        if self.config.addr != self.config.bootstrap_addr {
            if let Err(e) = self.send_version(&self.config.bootstrap_addr).await {
                warn!(
                    "bootstrap handshake with {} failed: {}",
                    self.config.bootstrap_addr, e
                );
            }
        }

        loop {
            let (stream, peer) = listener.accept().await?;
            let permit = Arc::clone(&self.connections)
                .acquire_owned()
                .await
                .map_err(|_| Error::Protocol("connection limiter closed".to_string()))?;

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream).await {
                    warn!("connection from {} failed: {}", peer, e);
                }
                drop(permit);
            });
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        let mut frame = Vec::new();
        tokio::time::timeout(READ_TIMEOUT, stream.read_to_end(&mut frame))
            .await
            .map_err(|_| Error::Protocol("read timed out".to_string()))??;

        let message = Message::decode(&frame)?;
        debug!("handling {} ({} bytes)", message.command(), frame.len());

        match message {
            Message::Version(p) => self.handle_version(p).await,
            Message::Addr(p) => self.handle_addr(p).await,
            Message::GetBlocks(p) => self.handle_get_blocks(p).await,
            Message::Inv(p) => self.handle_inv(p).await,
            Message::GetData(p) => self.handle_get_data(p).await,
            Message::Block(p) => self.handle_block(p).await,
            Message::Tx(p) => self.handle_tx(p).await,
        }
    }

    /// Height comparison decides who syncs from whom: the shorter chain
    /// asks for blocks, the longer one re-advertises its version. The
    /// merged peer set is then gossiped out so nodes beyond the hub
    /// learn of each other.
    async fn handle_version(&self, payload: VersionPayload) -> Result<()> {
        if payload.version != PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "unsupported protocol version {}",
                payload.version
            )));
        }
        self.remember_peer(&payload.addr_from).await;

        let my_height = self.chain.best_height()?;
        if payload.best_height > my_height {
            self.send_best_effort(
                &payload.addr_from,
                &Message::GetBlocks(GetBlocksPayload {
                    addr_from: self.config.addr.clone(),
                }),
            )
            .await;
        } else if my_height > payload.best_height {
            if let Err(e) = self.send_version(&payload.addr_from).await {
                warn!("version reply to {} failed: {}", payload.addr_from, e);
            }
        }

        // Peer discovery: everyone already knows the bootstrap node, so
        // it is the one peer the announcement skips.
        let peers = self.state.lock().await.known_peers.clone();
        let mut addrs = peers.clone();
        addrs.push(self.config.addr.clone());
        let announcement = Message::Addr(AddrPayload { addrs });
        for peer in peers {
            if peer != self.config.bootstrap_addr {
                self.send_best_effort(&peer, &announcement).await;
            }
        }
        Ok(())
    }

    /// Merge advertised addresses into the known set, then refresh our
    /// view of the chain from every peer we now know.
    async fn handle_addr(&self, payload: AddrPayload) -> Result<()> {
        let peers = {
            let mut state = self.state.lock().await;
            for addr in payload.addrs {
                if addr != self.config.addr && !state.known_peers.contains(&addr) {
                    state.known_peers.push(addr);
                }
            }
            state.known_peers.sort();
            state.known_peers.dedup();
            info!("{} known peers", state.known_peers.len());
            state.known_peers.clone()
        };

        for peer in peers {
            self.send_best_effort(
                &peer,
                &Message::GetBlocks(GetBlocksPayload {
                    addr_from: self.config.addr.clone(),
                }),
            )
            .await;
        }
        Ok(())
    }

    async fn handle_get_blocks(&self, payload: GetBlocksPayload) -> Result<()> {
        self.remember_peer(&payload.addr_from).await;
        let hashes = self.chain.block_hashes()?;
        self.send(
            &payload.addr_from,
            &Message::Inv(InvPayload {
                addr_from: self.config.addr.clone(),
                kind: InvKind::Block,
                items: hashes,
            }),
        )
        .await
    }

    async fn handle_inv(&self, payload: InvPayload) -> Result<()> {
        debug!(
            "inventory from {}: {} items",
            payload.addr_from,
            payload.items.len()
        );

        match payload.kind {
            InvKind::Block => {
                let mut wanted = Vec::new();
                for hash in &payload.items {
                    if !self.chain.contains_block(hash)? {
                        wanted.push(*hash);
                    }
                }

                // Blocks are fetched one at a time; the rest wait in
                // transit until each delivery triggers the next request.
                let next = {
                    let mut state = self.state.lock().await;
                    state.blocks_in_transit = wanted;
                    let next = state.blocks_in_transit.first().copied();
                    if next.is_some() {
                        state.blocks_in_transit.remove(0);
                    }
                    next
                };

                if let Some(hash) = next {
                    self.send(
                        &payload.addr_from,
                        &Message::GetData(GetDataPayload {
                            addr_from: self.config.addr.clone(),
                            kind: InvKind::Block,
                            id: hash,
                        }),
                    )
                    .await?;
                }
            }
            InvKind::Tx => {
                for txid in &payload.items {
                    let pooled = self.state.lock().await.mempool.contains(txid);
                    if !pooled {
                        self.send(
                            &payload.addr_from,
                            &Message::GetData(GetDataPayload {
                                addr_from: self.config.addr.clone(),
                                kind: InvKind::Tx,
                                id: *txid,
                            }),
                        )
                        .await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_get_data(&self, payload: GetDataPayload) -> Result<()> {
        match payload.kind {
            InvKind::Block => {
                let Some(block) = self.chain.get_block(&payload.id)? else {
                    warn!("peer {} requested unknown block {}", payload.addr_from, payload.id);
                    return Ok(());
                };
                self.send(
                    &payload.addr_from,
                    &Message::Block(BlockPayload {
                        addr_from: self.config.addr.clone(),
                        block,
                    }),
                )
                .await
            }
            InvKind::Tx => {
                let tx = self.state.lock().await.mempool.get(&payload.id);
                let Some(tx) = tx else {
                    warn!(
                        "peer {} requested unpooled transaction {}",
                        payload.addr_from, payload.id
                    );
                    return Ok(());
                };
                self.send(
                    &payload.addr_from,
                    &Message::Tx(TxPayload {
                        addr_from: self.config.addr.clone(),
                        tx,
                    }),
                )
                .await
            }
        }
    }

    async fn handle_block(&self, payload: BlockPayload) -> Result<()> {
        let block = payload.block;
        self.chain.add_block(&block)?;
        info!("stored block {} at height {}", block.hash, block.height);

        let next = {
            let mut state = self.state.lock().await;
            if state.blocks_in_transit.is_empty() {
                None
            } else {
                Some(state.blocks_in_transit.remove(0))
            }
        };

        match next {
            Some(hash) => {
                self.send(
                    &payload.addr_from,
                    &Message::GetData(GetDataPayload {
                        addr_from: self.config.addr.clone(),
                        kind: InvKind::Block,
                        id: hash,
                    }),
                )
                .await?;
            }
            None => {
                // Sync batch complete; blocks may have arrived out of
                // order, so rebuild the index from scratch.
                let chain = Arc::clone(&self.chain);
                let entries = tokio::task::spawn_blocking(move || chain.reindex_utxo())
                    .await
                    .map_err(|e| Error::Network(std::io::Error::other(e)))??;
                info!("utxo index rebuilt: {} entries", entries);
            }
        }
        Ok(())
    }

    async fn handle_tx(&self, payload: TxPayload) -> Result<()> {
        let txid = payload.tx.id;
        let inserted = self.state.lock().await.mempool.insert(payload.tx);
        if !inserted {
            return Ok(());
        }
        info!("pooled transaction {}", txid);

        // The hub relays announcements to everyone else.
        if self.config.addr == self.config.bootstrap_addr {
            let peers = self.state.lock().await.known_peers.clone();
            for peer in peers {
                if peer != self.config.addr && peer != payload.addr_from {
                    let _ = self
                        .send(
                            &peer,
                            &Message::Inv(InvPayload {
                                addr_from: self.config.addr.clone(),
                                kind: InvKind::Tx,
                                items: vec![txid],
                            }),
                        )
                        .await;
                }
            }
        }

        if self.config.miner_address.is_some() {
            let pooled = self.state.lock().await.mempool.len();
            if pooled >= MINE_THRESHOLD {
                self.mine_pending().await?;
            }
        }
        Ok(())
    }

    /// Drain the mempool into blocks: verify candidates, drop the ones
    /// the chain rejects, mine the rest plus a coinbase, and announce
    /// each block. Repeats while verifiable transactions remain.
    async fn mine_pending(&self) -> Result<()> {
        let Some(miner_address) = self.config.miner_address.clone() else {
            return Ok(());
        };
        let miner_pubkey_hash = pubkey_hash_from_address(&miner_address)?;

        loop {
            let candidates = self.state.lock().await.mempool.transactions();
            if candidates.is_empty() {
                return Ok(());
            }

            let mut selected = Vec::new();
            let mut rejected = Vec::new();
            let mut claimed: HashSet<(Hash256, u32)> = HashSet::new();
            for tx in candidates {
                match self.chain.verify_transaction(&tx) {
                    Ok(true) => {
                        // Conflicting spends within one batch wait for the
                        // next round, where the chain scan rejects them.
                        let conflicts = tx
                            .inputs
                            .iter()
                            .any(|input| claimed.contains(&(input.prev_txid, input.prev_index)));
                        if conflicts {
                            continue;
                        }
                        for input in &tx.inputs {
                            claimed.insert((input.prev_txid, input.prev_index));
                        }
                        selected.push(tx);
                    }
                    Ok(false) => rejected.push(tx.id),
                    Err(Error::NotFound(_)) => rejected.push(tx.id),
                    Err(e) => return Err(e),
                }
            }

            {
                let mut state = self.state.lock().await;
                for txid in &rejected {
                    state.mempool.remove(txid);
                    warn!("dropped invalid transaction {}", txid);
                }
            }
            if selected.is_empty() {
                info!("no verifiable transactions to mine");
                return Ok(());
            }

            let coinbase = Transaction::new_coinbase(
                miner_pubkey_hash.clone(),
                format!("Reward to '{}'", miner_address),
            )?;
            let mut txs = selected;
            txs.push(coinbase);
            let mined_ids: Vec<Hash256> = txs.iter().map(|tx| tx.id).collect();

            let chain = Arc::clone(&self.chain);
            let block = tokio::task::spawn_blocking(move || chain.mine_block(txs))
                .await
                .map_err(|e| Error::Network(std::io::Error::other(e)))??;
            info!(
                "mined block {} with {} transactions",
                block.hash,
                block.transactions.len()
            );

            let remaining = {
                let mut state = self.state.lock().await;
                for txid in &mined_ids {
                    state.mempool.remove(txid);
                }
                state.mempool.len()
            };

            let peers = self.state.lock().await.known_peers.clone();
            for peer in peers {
                if peer != self.config.addr {
                    let _ = self
                        .send(
                            &peer,
                            &Message::Inv(InvPayload {
                                addr_from: self.config.addr.clone(),
                                kind: InvKind::Block,
                                items: vec![block.hash],
                            }),
                        )
                        .await;
                }
            }

            if remaining == 0 {
                return Ok(());
            }
        }
    }

    async fn send_version(&self, addr: &str) -> Result<()> {
        let payload = VersionPayload {
            version: PROTOCOL_VERSION,
            best_height: self.chain.best_height()?,
            addr_from: self.config.addr.clone(),
        };
        self.send(addr, &Message::Version(payload)).await
    }

    /// Gossip send: a failed delivery is logged (the peer is already
    /// pruned by `send`) without failing the handler.
    async fn send_best_effort(&self, addr: &str, message: &Message) {
        if let Err(e) = self.send(addr, message).await {
            debug!("skipping peer {}: {}", addr, e);
        }
    }

    /// One message per connection: dial, write the frame, close. An
    /// unreachable peer is pruned from the known set.
    async fn send(&self, addr: &str, message: &Message) -> Result<()> {
        let frame = message.encode()?;
        match TcpStream::connect(addr).await {
            Ok(mut stream) => {
                stream.write_all(&frame).await?;
                stream.shutdown().await?;
                Ok(())
            }
            Err(e) => {
                warn!("peer {} unreachable, dropping it: {}", addr, e);
                let mut state = self.state.lock().await;
                state.known_peers.retain(|peer| peer != addr);
                Err(Error::Network(e))
            }
        }
    }

    /// Record a peer address; returns true if it was new.
    async fn remember_peer(&self, addr: &str) -> bool {
        if addr == self.config.addr {
            return false;
        }
        let mut state = self.state.lock().await;
        if state.known_peers.iter().any(|peer| peer == addr) {
            false
        } else {
            info!("added peer {}", addr);
            state.known_peers.push(addr.to_string());
            true
        }
    }
}

/// Hand a locally built transaction to a running node.
pub async fn send_transaction(node_addr: &str, addr_from: &str, tx: &Transaction) -> Result<()> {
    let frame = Message::Tx(TxPayload {
        addr_from: addr_from.to_string(),
        tx: tx.clone(),
    })
    .encode()?;

    let mut stream = TcpStream::connect(node_addr).await?;
    stream.write_all(&frame).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SUBSIDY;
    use crate::wallet::KeyPair;

    fn temp_db() -> sled::Db {
        sled::Config::new().temporary(true).open().unwrap()
    }

    fn config(addr: &str, bootstrap: &str) -> NodeConfig {
        NodeConfig {
            addr: addr.to_string(),
            bootstrap_addr: bootstrap.to_string(),
            miner_address: None,
        }
    }

    /// Bare listener that records every decoded frame it receives.
    async fn spawn_collector(addr: &str) -> Arc<Mutex<Vec<Message>>> {
        let listener = TcpListener::bind(addr).await.unwrap();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&frames);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = Vec::new();
                if stream.read_to_end(&mut buf).await.is_ok() {
                    if let Ok(message) = Message::decode(&buf) {
                        sink.lock().await.push(message);
                    }
                }
            }
        });
        frames
    }

    async fn send_frame(addr: &str, message: &Message) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&message.encode().unwrap()).await.unwrap();
        stream.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_fresh_node_syncs_from_bootstrap() {
        let addr_a = "127.0.0.1:28751";
        let addr_b = "127.0.0.1:28752";

        // Node A holds a two-block chain.
        let db_a = temp_db();
        let miner = KeyPair::generate();
        let chain_a = Arc::new(Blockchain::create(&db_a, miner.pubkey_hash().to_vec()).unwrap());
        let extra = Transaction::new_coinbase(miner.pubkey_hash().to_vec(), "second".to_string())
            .unwrap();
        chain_a.mine_block(vec![extra]).unwrap();

        let server_a = Server::new(config(addr_a, addr_a), Arc::clone(&chain_a));
        tokio::spawn(Arc::clone(&server_a).run());
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Node B starts empty and bootstraps from A.
        let db_b = temp_db();
        let chain_b = Arc::new(Blockchain::open(&db_b).unwrap());
        let server_b = Server::new(config(addr_b, addr_a), Arc::clone(&chain_b));
        tokio::spawn(Arc::clone(&server_b).run());

        for _ in 0..100 {
            if chain_b.best_height().unwrap() == Some(1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert_eq!(chain_b.best_height().unwrap(), Some(1));
        assert_eq!(chain_b.tip_hash().unwrap(), chain_a.tip_hash().unwrap());
        // The sync ended with a rebuilt UTXO index.
        assert_eq!(
            chain_b.utxo_index().balance(&miner.pubkey_hash()).unwrap(),
            2 * SUBSIDY
        );
    }

    #[tokio::test]
    async fn test_version_broadcasts_known_peers() {
        let hub_addr = "127.0.0.1:28754";
        let peer_addr = "127.0.0.1:28755";
        let ghost_addr = "127.0.0.1:28756";

        let db = temp_db();
        let miner = KeyPair::generate();
        let chain = Arc::new(Blockchain::create(&db, miner.pubkey_hash().to_vec()).unwrap());
        let hub = Server::new(config(hub_addr, hub_addr), chain);
        tokio::spawn(Arc::clone(&hub).run());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let frames = spawn_collector(peer_addr).await;

        // Two peers introduce themselves at the hub's height; the second
        // never listens.
        for addr_from in [peer_addr, ghost_addr] {
            send_frame(
                hub_addr,
                &Message::Version(VersionPayload {
                    version: PROTOCOL_VERSION,
                    best_height: Some(0),
                    addr_from: addr_from.to_string(),
                }),
            )
            .await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // The first peer must learn about the second through an addr
        // broadcast.
        let mut learned = false;
        for _ in 0..50 {
            learned = frames.lock().await.iter().any(|message| {
                matches!(message, Message::Addr(p) if p.addrs.iter().any(|a| a == ghost_addr))
            });
            if learned {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(learned, "no addr broadcast reached the registered peer");
    }

    #[tokio::test]
    async fn test_unreachable_peer_does_not_abort_gossip() {
        let hub_addr = "127.0.0.1:28757";
        let live_addr = "127.0.0.1:28758";
        // Sorts before the live peer and is never bound.
        let dead_addr = "127.0.0.1:28750";

        let db = temp_db();
        let miner = KeyPair::generate();
        let chain = Arc::new(Blockchain::create(&db, miner.pubkey_hash().to_vec()).unwrap());
        let hub = Server::new(config(hub_addr, hub_addr), chain);
        tokio::spawn(Arc::clone(&hub).run());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let frames = spawn_collector(live_addr).await;

        send_frame(
            hub_addr,
            &Message::Addr(AddrPayload {
                addrs: vec![dead_addr.to_string(), live_addr.to_string()],
            }),
        )
        .await;

        // The dead peer fails first; the live one must still be served.
        let mut reached = false;
        for _ in 0..50 {
            reached = frames
                .lock()
                .await
                .iter()
                .any(|message| matches!(message, Message::GetBlocks(_)));
            if reached {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(reached, "gossip stopped at the unreachable peer");
    }

    #[tokio::test]
    async fn test_announced_transaction_is_pooled() {
        let addr = "127.0.0.1:28753";

        let db = temp_db();
        let miner = KeyPair::generate();
        let chain = Arc::new(Blockchain::create(&db, miner.pubkey_hash().to_vec()).unwrap());
        let server = Server::new(config(addr, addr), Arc::clone(&chain));
        tokio::spawn(Arc::clone(&server).run());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let tx = Transaction::new_coinbase(miner.pubkey_hash().to_vec(), "pooled".to_string())
            .unwrap();
        send_transaction(addr, "127.0.0.1:9", &tx).await.unwrap();

        let mut pooled = 0;
        for _ in 0..100 {
            pooled = server.mempool_len().await;
            if pooled == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(pooled, 1);
    }
}
