//! Shared Ledger State Module
//!
//! The chain and the peer directory are shared between the listener's
//! handler tasks and the node's own request path. Every operation takes the
//! relevant lock for its full duration and never awaits network I/O while
//! holding it; no operation holds both locks at once.

use acablock_protocol::{Block, Chain, ChainStats, PeerDirectory, ProtocolError, Record};
use thiserror::Error;
use tokio::sync::RwLock;

/// Storage-related errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Chain rejected: {reason}")]
    ChainRejected { reason: String },

    #[error("Block rejected: {reason}")]
    BlockRejected { reason: String },
}

fn rejection_reason(err: ProtocolError) -> String {
    match err {
        ProtocolError::ChainRejected { reason } => reason,
        other => other.to_string(),
    }
}

/// Lock-guarded chain and peer directory of one node
#[derive(Debug, Default)]
pub struct LedgerStore {
    /// Local copy of the chain
    chain: RwLock<Chain>,
    /// Known peers, own address excluded
    peers: RwLock<PeerDirectory>,
}

impl LedgerStore {
    /// Create a store holding a fresh genesis chain and no peers
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a local record and return the new block
    pub async fn append_record(&self, record: Record) -> Block {
        self.chain.write().await.append(record).clone()
    }

    /// Append a replicated block if it extends the current tip
    pub async fn push_block(&self, block: Block) -> Result<u64, StorageError> {
        let index = block.index;
        self.chain
            .write()
            .await
            .push_block(block)
            .map_err(|e| StorageError::BlockRejected {
                reason: rejection_reason(e),
            })?;
        Ok(index)
    }

    /// Swap in a peer-supplied chain if it is valid and no shorter
    pub async fn replace_chain(&self, candidate: Vec<Block>) -> Result<usize, StorageError> {
        let mut chain = self.chain.write().await;
        chain
            .replace(candidate)
            .map_err(|e| StorageError::ChainRejected {
                reason: rejection_reason(e),
            })?;
        Ok(chain.len())
    }

    /// Copy of the whole chain
    pub async fn chain(&self) -> Chain {
        self.chain.read().await.clone()
    }

    pub async fn blocks(&self) -> Vec<Block> {
        self.chain.read().await.blocks().to_vec()
    }

    pub async fn records(&self) -> Vec<Record> {
        self.chain.read().await.records()
    }

    pub async fn chain_stats(&self) -> ChainStats {
        ChainStats::from_chain(&*self.chain.read().await)
    }

    /// Current peer addresses
    pub async fn peers(&self) -> Vec<String> {
        self.peers.read().await.snapshot()
    }

    pub async fn add_peer(&self, addr: &str) -> bool {
        self.peers.write().await.add_peer(addr)
    }

    pub async fn remove_peer(&self, addr: &str) -> bool {
        self.peers.write().await.remove(addr)
    }

    /// Register a joining peer.
    ///
    /// Returns the directory as it was before the joiner was added, without
    /// the joiner. Snapshot and insert happen under one lock so concurrent
    /// joins always see each other.
    pub async fn admit_peer(&self, joiner: &str) -> PeerDirectory {
        let mut peers = self.peers.write().await;
        let mut existing = peers.clone();
        existing.remove(joiner);
        peers.add_peer(joiner);
        existing
    }

    /// Merge a received host list, skipping `local_addr`
    pub async fn merge_peers(&self, hosts: &[String], local_addr: &str) -> usize {
        self.peers
            .write()
            .await
            .merge(hosts.iter().map(String::as_str), local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> Record {
        Record {
            name: name.to_string(),
            grade: "15".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_append_and_list() {
        let store = LedgerStore::new();
        let block = store.append_record(record("Ana")).await;
        assert_eq!(block.index, 1);
        assert_eq!(store.blocks().await.len(), 2);
        assert_eq!(store.records().await, vec![record("Ana")]);
        assert_eq!(store.chain_stats().await.record_count, 1);
    }

    #[tokio::test]
    async fn test_replace_chain_policy() {
        let store = LedgerStore::new();
        store.append_record(record("Ana")).await;

        let shorter = Chain::new().blocks().to_vec();
        assert!(matches!(
            store.replace_chain(shorter).await,
            Err(StorageError::ChainRejected { .. })
        ));
        assert_eq!(store.blocks().await.len(), 2);

        let mut remote = Chain::new();
        remote.append(record("Luis"));
        remote.append(record("Eva"));
        assert_eq!(store.replace_chain(remote.blocks().to_vec()).await.unwrap(), 3);
        assert_eq!(store.chain().await, remote);
    }

    #[tokio::test]
    async fn test_push_block() {
        let origin = LedgerStore::new();
        let replica = LedgerStore::new();
        replica.replace_chain(origin.blocks().await).await.unwrap();

        let block = origin.append_record(record("Ana")).await;
        assert_eq!(replica.push_block(block.clone()).await.unwrap(), 1);
        assert!(matches!(
            replica.push_block(block).await,
            Err(StorageError::BlockRejected { .. })
        ));
        assert_eq!(replica.chain().await, origin.chain().await);
    }

    #[tokio::test]
    async fn test_admit_peer_returns_previous_members() {
        let store = LedgerStore::new();
        assert!(store.admit_peer("b:1").await.is_empty());

        let existing = store.admit_peer("c:1").await;
        assert_eq!(existing.snapshot(), vec!["b:1"]);
        assert_eq!(store.peers().await, vec!["b:1", "c:1"]);

        // re-announcing does not list the joiner as its own peer
        let existing = store.admit_peer("b:1").await;
        assert_eq!(existing.snapshot(), vec!["c:1"]);
        assert_eq!(store.peers().await.len(), 2);
    }

    #[tokio::test]
    async fn test_merge_and_remove_peers() {
        let store = LedgerStore::new();
        store.add_peer("b:1").await;
        let hosts = vec!["a:1".to_string(), "b:1".to_string(), "c:1".to_string()];
        assert_eq!(store.merge_peers(&hosts, "a:1").await, 1);
        assert!(store.remove_peer("b:1").await);
        assert_eq!(store.peers().await, vec!["c:1"]);
    }
}
