//! Node Management Module
//!
//! This module wires the shared ledger state, the gossip handler and the
//! listener into a running node, and drives the join handshake and the
//! broadcast of locally appended records.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use acablock_protocol::{Block, ChainStats, Message, Record, PROTOCOL_VERSION};

use crate::gossip::{fan_out, GossipHandler, GossipStats};
use crate::storage::LedgerStore;
use crate::transport::{self, TransportConfig, TransportError};

/// Configuration for an Acablock node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address the listener binds to
    pub listen_addr: String,
    /// Address announced to peers (defaults to the bound address)
    pub advertise_addr: Option<String>,
    /// Network timeouts and limits
    pub transport: TransportConfig,
    /// How long to wait for the seed's chain when joining (milliseconds)
    pub join_timeout_ms: u64,
    /// Attempts per join request before giving up
    pub join_attempts: u32,
    /// Pause between join request attempts (milliseconds)
    pub join_retry_delay_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9000".to_string(),
            advertise_addr: None,
            transport: TransportConfig::default(),
            join_timeout_ms: 10000, // 10 seconds
            join_attempts: 3,
            join_retry_delay_ms: 250,
        }
    }
}

/// Progress of the bootstrap handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    /// Only the local genesis chain, no peers
    Unjoined,
    /// Join requests sent, waiting for the seed's chain
    Joining,
    /// Caught up with the network
    Joined,
    /// The join did not complete in time; terminal
    JoinFailed,
}

/// Node errors
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Join through {seed} failed: {source}")]
    Join {
        seed: String,
        source: TransportError,
    },

    #[error("No chain from {seed} within {timeout_ms}ms")]
    JoinTimeout { seed: String, timeout_ms: u64 },

    #[error("Cannot join through our own address {addr}")]
    SelfJoin { addr: String },

    #[error("Join already attempted (state {state:?})")]
    AlreadyJoined { state: JoinState },
}

struct NodeInner {
    config: NodeConfig,
    local_addr: String,
    store: Arc<LedgerStore>,
    gossip: Arc<GossipHandler>,
    join_state: Arc<watch::Sender<JoinState>>,
    listener: AbortHandle,
}

/// A running Acablock node; cheap to clone
#[derive(Clone)]
pub struct LedgerNode {
    inner: Arc<NodeInner>,
}

impl LedgerNode {
    /// Bind the listener and start serving peers
    pub async fn start_listening(config: NodeConfig) -> Result<Self, NodeError> {
        let bind_error = |source| NodeError::Bind {
            addr: config.listen_addr.clone(),
            source,
        };
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(bind_error)?;
        let bound = listener.local_addr().map_err(bind_error)?;
        let local_addr = config
            .advertise_addr
            .clone()
            .unwrap_or_else(|| bound.to_string());

        let store = Arc::new(LedgerStore::new());
        let (join_tx, _) = watch::channel(JoinState::Unjoined);
        let join_state = Arc::new(join_tx);
        let gossip = Arc::new(GossipHandler::new(
            local_addr.clone(),
            store.clone(),
            config.transport.clone(),
            join_state.clone(),
        ));

        let task = tokio::spawn({
            let gossip = gossip.clone();
            let transport = config.transport.clone();
            async move {
                if let Err(e) = transport::serve(listener, gossip, transport).await {
                    error!(error = %e, "Listener terminated");
                }
            }
        });
        info!(%bound, %local_addr, protocol = PROTOCOL_VERSION, "Node listening");

        Ok(Self {
            inner: Arc::new(NodeInner {
                config,
                local_addr,
                store,
                gossip,
                join_state,
                listener: task.abort_handle(),
            }),
        })
    }

    /// Join through `seed`, or start as the first host when there is none
    pub async fn join_network(&self, seed: Option<&str>) -> Result<(), NodeError> {
        let seed = seed.map(str::trim).filter(|s| !s.is_empty());
        if seed == Some(self.inner.local_addr.as_str()) {
            return Err(NodeError::SelfJoin {
                addr: self.inner.local_addr.clone(),
            });
        }

        let mut state = self.inner.join_state.subscribe();
        let target = if seed.is_some() {
            JoinState::Joining
        } else {
            JoinState::Joined
        };
        self.claim_join(target)?;

        let seed = match seed {
            Some(seed) => seed,
            None => {
                info!("No seed given, starting as the first host");
                return Ok(());
            }
        };
        info!(seed, "Joining network");

        let local = self.inner.local_addr.as_str();
        for message in [Message::new_host(local), Message::new_block(local)] {
            if let Err(e) = self.send_with_retry(seed, &message).await {
                self.inner.join_state.send_replace(JoinState::JoinFailed);
                return Err(e);
            }
        }

        let timeout_ms = self.inner.config.join_timeout_ms;
        let synced = timeout(
            Duration::from_millis(timeout_ms),
            state.wait_for(|s| *s == JoinState::Joined),
        )
        .await
        .map(|changed| changed.is_ok())
        .unwrap_or(false);

        if synced {
            info!(seed, "Joined network");
            return Ok(());
        }

        // a late SET_BLOCKS may still have won the race
        self.inner.join_state.send_if_modified(|s| {
            if *s == JoinState::Joining {
                *s = JoinState::JoinFailed;
                true
            } else {
                false
            }
        });
        if self.join_state() == JoinState::Joined {
            return Ok(());
        }
        warn!(seed, timeout_ms, "Join timed out");
        Err(NodeError::JoinTimeout {
            seed: seed.to_string(),
            timeout_ms,
        })
    }

    /// Move out of `Unjoined` in one step so only one join can run.
    fn claim_join(&self, target: JoinState) -> Result<(), NodeError> {
        let mut current = JoinState::Unjoined;
        let claimed = self.inner.join_state.send_if_modified(|s| {
            current = *s;
            if *s == JoinState::Unjoined {
                *s = target;
                true
            } else {
                false
            }
        });
        if claimed {
            Ok(())
        } else {
            Err(NodeError::AlreadyJoined { state: current })
        }
    }

    async fn send_with_retry(&self, seed: &str, message: &Message) -> Result<(), NodeError> {
        let attempts = self.inner.config.join_attempts.max(1);
        let delay = Duration::from_millis(self.inner.config.join_retry_delay_ms);
        let mut attempt = 1;
        loop {
            match transport::send(seed, message, &self.inner.config.transport).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(seed, attempt, kind = ?message.kind, error = %e, "Join request failed, retrying");
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(NodeError::Join {
                        seed: seed.to_string(),
                        source,
                    })
                }
            }
        }
    }

    /// Append a record locally and replicate it to every known peer
    pub async fn append_record(&self, record: Record) -> Block {
        let block = self.inner.store.append_record(record).await;
        info!(index = block.index, hash = %block.hash, "Appended record");
        self.broadcast_block(&block).await;
        block
    }

    async fn broadcast_block(&self, block: &Block) {
        let message = match Message::add_block(block) {
            Ok(message) => message,
            Err(e) => {
                error!(index = block.index, error = %e, "Cannot encode block for broadcast");
                return;
            }
        };
        let peers = self.inner.store.peers().await;
        let total = peers.len();
        let deliveries = peers
            .into_iter()
            .map(|peer| (peer, message.clone()))
            .collect();

        let failed = fan_out(deliveries, &self.inner.config.transport).await;
        self.inner.gossip.record_send_failures(failed);
        if failed > 0 {
            warn!(index = block.index, failed, total, "Block broadcast incomplete");
        }
    }

    /// Records of every non-genesis block
    pub async fn list_records(&self) -> Vec<Record> {
        self.inner.store.records().await
    }

    /// Full local chain, genesis included
    pub async fn list_blocks(&self) -> Vec<Block> {
        self.inner.store.blocks().await
    }

    /// Known peers, own address excluded
    pub async fn list_peers(&self) -> Vec<String> {
        self.inner.store.peers().await
    }

    pub async fn chain_stats(&self) -> ChainStats {
        self.inner.store.chain_stats().await
    }

    pub fn gossip_stats(&self) -> GossipStats {
        self.inner.gossip.stats()
    }

    /// Address announced to peers
    pub fn local_addr(&self) -> &str {
        &self.inner.local_addr
    }

    pub fn join_state(&self) -> JoinState {
        *self.inner.join_state.borrow()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Stop accepting connections
    pub fn shutdown(&self) {
        info!(local_addr = %self.inner.local_addr, "Shutting down node");
        self.inner.listener.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> NodeConfig {
        NodeConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_node_config() {
        let config = NodeConfig::default();
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert!(config.advertise_addr.is_none());
        assert_eq!(config.join_attempts, 3);
    }

    #[tokio::test]
    async fn test_node_creation() {
        let node = LedgerNode::start_listening(local_config()).await.unwrap();
        assert!(node.local_addr().starts_with("127.0.0.1:"));
        assert!(!node.local_addr().ends_with(":0"));
        assert_eq!(node.join_state(), JoinState::Unjoined);
        assert!(node.list_peers().await.is_empty());
        assert_eq!(node.list_blocks().await.len(), 1);
        node.shutdown();
    }

    #[tokio::test]
    async fn test_advertised_address() {
        let config = NodeConfig {
            advertise_addr: Some("node-a.local:9000".to_string()),
            ..local_config()
        };
        let node = LedgerNode::start_listening(config).await.unwrap();
        assert_eq!(node.local_addr(), "node-a.local:9000");
        node.shutdown();
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let first = LedgerNode::start_listening(local_config()).await.unwrap();
        let config = NodeConfig {
            listen_addr: first.local_addr().to_string(),
            ..Default::default()
        };
        let result = LedgerNode::start_listening(config).await;
        assert!(matches!(result, Err(NodeError::Bind { .. })));
        first.shutdown();
    }

    #[tokio::test]
    async fn test_first_host_joins_immediately() {
        let node = LedgerNode::start_listening(local_config()).await.unwrap();
        node.join_network(None).await.unwrap();
        assert_eq!(node.join_state(), JoinState::Joined);

        let again = node.join_network(None).await;
        assert!(matches!(again, Err(NodeError::AlreadyJoined { .. })));
        node.shutdown();
    }

    #[tokio::test]
    async fn test_self_join_rejected() {
        let node = LedgerNode::start_listening(local_config()).await.unwrap();
        let own = node.local_addr().to_string();
        let result = node.join_network(Some(&own)).await;
        assert!(matches!(result, Err(NodeError::SelfJoin { .. })));
        assert_eq!(node.join_state(), JoinState::Unjoined);
        node.shutdown();
    }

    #[tokio::test]
    async fn test_concurrent_joins_claim_once() {
        // accepts every connection and never answers
        let seed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let seed_addr = seed.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = seed.accept().await {
                held.push(stream);
            }
        });

        let config = NodeConfig {
            join_timeout_ms: 200,
            ..local_config()
        };
        let node = LedgerNode::start_listening(config).await.unwrap();
        let (first, second) = tokio::join!(
            node.join_network(Some(&seed_addr)),
            node.join_network(Some(&seed_addr))
        );

        let outcomes = [first, second];
        let already = outcomes
            .iter()
            .filter(|r| matches!(r, Err(NodeError::AlreadyJoined { .. })))
            .count();
        let timed_out = outcomes
            .iter()
            .filter(|r| matches!(r, Err(NodeError::JoinTimeout { .. })))
            .count();
        assert_eq!((already, timed_out), (1, 1));
        assert_eq!(node.join_state(), JoinState::JoinFailed);
        node.shutdown();
    }

    #[tokio::test]
    async fn test_append_without_peers() {
        let node = LedgerNode::start_listening(local_config()).await.unwrap();
        node.join_network(None).await.unwrap();

        let record = Record {
            name: "Ana".to_string(),
            grade: "18".to_string(),
            ..Default::default()
        };
        let block = node.append_record(record.clone()).await;
        assert_eq!(block.index, 1);
        assert_eq!(node.list_records().await, vec![record]);
        assert_eq!(node.chain_stats().await.total_blocks, 2);
        assert_eq!(node.gossip_stats().sends_failed, 0);
        node.shutdown();
    }
}
