// Wire message framing and payloads

use crate::core::{Block, Hash256, Transaction};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Fixed width of the command tag opening every frame.
pub const COMMAND_LEN: usize = 12;

/// Protocol version advertised in handshakes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Handshake: advertise our protocol version and chain height.
/// `best_height` is `None` for a node with an empty store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionPayload {
    pub version: u32,
    pub best_height: Option<u64>,
    pub addr_from: String,
}

/// Share addresses of known peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrPayload {
    pub addrs: Vec<String>,
}

/// Ask a peer for its full list of block hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlocksPayload {
    pub addr_from: String,
}

/// What an inventory or data request refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvKind {
    Block,
    Tx,
}

/// Announce items (blocks or transactions) the sender can serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvPayload {
    pub addr_from: String,
    pub kind: InvKind,
    pub items: Vec<Hash256>,
}

/// Request one announced item by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDataPayload {
    pub addr_from: String,
    pub kind: InvKind,
    pub id: Hash256,
}

/// Deliver one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPayload {
    pub addr_from: String,
    pub block: Block,
}

/// Deliver one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxPayload {
    pub addr_from: String,
    pub tx: Transaction,
}

/// One peer-to-peer message. On the wire: a zero-padded `COMMAND_LEN`-byte
/// ASCII command tag followed by the bincode-encoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionPayload),
    Addr(AddrPayload),
    GetBlocks(GetBlocksPayload),
    Inv(InvPayload),
    GetData(GetDataPayload),
    Block(BlockPayload),
    Tx(TxPayload),
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Addr(_) => "addr",
            Message::GetBlocks(_) => "getblocks",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = match self {
            Message::Version(p) => bincode::serialize(p)?,
            Message::Addr(p) => bincode::serialize(p)?,
            Message::GetBlocks(p) => bincode::serialize(p)?,
            Message::Inv(p) => bincode::serialize(p)?,
            Message::GetData(p) => bincode::serialize(p)?,
            Message::Block(p) => bincode::serialize(p)?,
            Message::Tx(p) => bincode::serialize(p)?,
        };

        let mut frame = Vec::with_capacity(COMMAND_LEN + payload.len());
        frame.extend_from_slice(&command_tag(self.command()));
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < COMMAND_LEN {
            return Err(Error::Protocol(format!(
                "frame too short: {} bytes",
                frame.len()
            )));
        }

        let command = parse_command_tag(&frame[..COMMAND_LEN])?;
        let payload = &frame[COMMAND_LEN..];

        let message = match command.as_str() {
            "version" => Message::Version(bincode::deserialize(payload)?),
            "addr" => Message::Addr(bincode::deserialize(payload)?),
            "getblocks" => Message::GetBlocks(bincode::deserialize(payload)?),
            "inv" => Message::Inv(bincode::deserialize(payload)?),
            "getdata" => Message::GetData(bincode::deserialize(payload)?),
            "block" => Message::Block(bincode::deserialize(payload)?),
            "tx" => Message::Tx(bincode::deserialize(payload)?),
            other => {
                return Err(Error::Protocol(format!("unknown command {:?}", other)));
            }
        };
        Ok(message)
    }
}

fn command_tag(command: &str) -> [u8; COMMAND_LEN] {
    debug_assert!(command.len() <= COMMAND_LEN);
    let mut tag = [0u8; COMMAND_LEN];
    tag[..command.len()].copy_from_slice(command.as_bytes());
    tag
}

fn parse_command_tag(tag: &[u8]) -> Result<String> {
    let end = tag.iter().position(|&b| b == 0).unwrap_or(tag.len());
    if tag[end..].iter().any(|&b| b != 0) {
        return Err(Error::Protocol("malformed command tag".to_string()));
    }
    String::from_utf8(tag[..end].to_vec())
        .map_err(|_| Error::Protocol("malformed command tag".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version() -> Message {
        Message::Version(VersionPayload {
            version: PROTOCOL_VERSION,
            best_height: Some(3),
            addr_from: "127.0.0.1:3000".to_string(),
        })
    }

    #[test]
    fn test_round_trip() {
        let messages = vec![
            version(),
            Message::Addr(AddrPayload {
                addrs: vec!["127.0.0.1:3001".to_string()],
            }),
            Message::GetBlocks(GetBlocksPayload {
                addr_from: "127.0.0.1:3000".to_string(),
            }),
            Message::Inv(InvPayload {
                addr_from: "127.0.0.1:3000".to_string(),
                kind: InvKind::Block,
                items: vec![Hash256::new([7u8; 32])],
            }),
            Message::GetData(GetDataPayload {
                addr_from: "127.0.0.1:3000".to_string(),
                kind: InvKind::Tx,
                id: Hash256::new([9u8; 32]),
            }),
        ];

        for message in messages {
            let frame = message.encode().unwrap();
            assert_eq!(Message::decode(&frame).unwrap(), message);
        }
    }

    #[test]
    fn test_command_tag_is_fixed_width() {
        let frame = version().encode().unwrap();
        assert_eq!(&frame[..7], b"version");
        assert_eq!(&frame[7..COMMAND_LEN], &[0u8; 5]);
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut frame = vec![0u8; COMMAND_LEN];
        frame[..4].copy_from_slice(b"ping");
        assert!(matches!(Message::decode(&frame), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_short_frame_rejected() {
        assert!(matches!(Message::decode(b"ver"), Err(Error::Protocol(_))));
        assert!(matches!(Message::decode(b""), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_interior_zero_in_tag_rejected() {
        let mut frame = vec![0u8; COMMAND_LEN];
        frame[0] = b't';
        frame[2] = b'x';
        assert!(matches!(Message::decode(&frame), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let frame = version().encode().unwrap();
        assert!(Message::decode(&frame[..COMMAND_LEN + 2]).is_err());
    }
}
