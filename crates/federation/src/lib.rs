//! Gossip replication and peer discovery
//!
//! This crate runs an Acablock node: a TCP listener serving one-shot
//! protocol messages, the gossip state machine applying them to the shared
//! chain and peer directory, the join handshake, and block broadcast.

pub mod gossip;
pub mod node;
pub mod storage;
pub mod transport;

// Re-export key types
pub use gossip::{GossipError, GossipHandler, GossipStats};
pub use node::{JoinState, LedgerNode, NodeConfig, NodeError};
pub use storage::{LedgerStore, StorageError};
pub use transport::{MessageHandler, TransportConfig, TransportError};
