//! Acablock protocol types
//!
//! This crate defines the replicated ledger model (records, blocks and the
//! hash-linked chain), the peer directory, and the single-line wire messages
//! exchanged between Acablock nodes.

pub mod errors;
pub mod ledger;
pub mod message;
pub mod peers;
pub mod stats;

pub use errors::ProtocolError;
pub use ledger::{is_valid_chain, Block, Chain, Record, GENESIS_PREVIOUS_HASH};
pub use message::{Message, MessageKind};
pub use peers::{join_host_list, parse_host_list, PeerDirectory};
pub use stats::ChainStats;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Version of the Acablock protocol, reported by nodes at startup
pub const PROTOCOL_VERSION: &str = "0.1.0";
