// Peer-to-peer networking

pub mod mempool;
pub mod message;
pub mod server;

pub use mempool::Mempool;
pub use message::{
    AddrPayload, BlockPayload, COMMAND_LEN, GetBlocksPayload, GetDataPayload, InvKind, InvPayload,
    Message, PROTOCOL_VERSION, TxPayload, VersionPayload,
};
pub use server::{NodeConfig, Server, send_transaction};
