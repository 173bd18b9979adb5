//! Wire messages exchanged between nodes.
//!
//! Each message travels alone on its own TCP connection as one line of
//! compact JSON: `{"kind":<code>,"payload":"<text>"}`. JSON string escaping
//! keeps the encoded line free of raw newlines whatever the payload holds.

use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;
use crate::ledger::{Block, Chain};
use crate::peers::{join_host_list, parse_host_list};

/// Kind of a wire message, serialized as its integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageKind {
    /// A node asks to join; payload is its address
    NewHost,
    /// Host list announcement; payload is comma-joined addresses
    AddHost,
    /// A freshly appended block; payload is the serialized block
    AddBlock,
    /// Request for the full chain; payload is the requester's address
    NewBlock,
    /// Full chain transfer; payload is the serialized chain
    SetBlocks,
}

impl MessageKind {
    pub fn code(self) -> u8 {
        match self {
            MessageKind::NewHost => 0,
            MessageKind::AddHost => 1,
            MessageKind::AddBlock => 2,
            MessageKind::NewBlock => 3,
            MessageKind::SetBlocks => 4,
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(MessageKind::NewHost),
            1 => Ok(MessageKind::AddHost),
            2 => Ok(MessageKind::AddBlock),
            3 => Ok(MessageKind::NewBlock),
            4 => Ok(MessageKind::SetBlocks),
            other => Err(ProtocolError::malformed(format!(
                "unknown message kind {}",
                other
            ))),
        }
    }
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        kind.code()
    }
}

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub payload: String,
}

impl Message {
    pub fn new(kind: MessageKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Join request carrying the joiner's address.
    pub fn new_host(addr: &str) -> Self {
        Self::new(MessageKind::NewHost, addr)
    }

    /// Host list announcement.
    pub fn add_host<S: AsRef<str>>(hosts: &[S]) -> Self {
        Self::new(MessageKind::AddHost, join_host_list(hosts))
    }

    /// Chain request carrying the requester's address.
    pub fn new_block(addr: &str) -> Self {
        Self::new(MessageKind::NewBlock, addr)
    }

    /// Full chain transfer.
    pub fn set_blocks(chain: &Chain) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageKind::SetBlocks, serde_json::to_string(chain)?))
    }

    /// Single block replication.
    pub fn add_block(block: &Block) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageKind::AddBlock, serde_json::to_string(block)?))
    }

    /// Encode as a single line, without the trailing newline.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode one line; a trailing `\n` or `\r\n` is ignored.
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\n', '\r']);
        if line.is_empty() {
            return Err(ProtocolError::malformed("empty line"));
        }
        serde_json::from_str(line).map_err(|e| ProtocolError::malformed(e.to_string()))
    }

    /// Payload read as a single address.
    pub fn payload_addr(&self) -> Result<&str, ProtocolError> {
        let addr = self.payload.trim();
        if addr.is_empty() {
            return Err(ProtocolError::malformed(format!(
                "{:?} without an address",
                self.kind
            )));
        }
        Ok(addr)
    }

    /// Payload read as a host list.
    pub fn payload_hosts(&self) -> Vec<String> {
        parse_host_list(&self.payload)
    }

    /// Payload read as a serialized block.
    pub fn payload_block(&self) -> Result<Block, ProtocolError> {
        serde_json::from_str(&self.payload)
            .map_err(|e| ProtocolError::malformed(format!("bad block payload: {}", e)))
    }

    /// Payload read as a serialized chain.
    pub fn payload_blocks(&self) -> Result<Vec<Block>, ProtocolError> {
        serde_json::from_str(&self.payload)
            .map_err(|e| ProtocolError::malformed(format!("bad chain payload: {}", e)))
    }
}
