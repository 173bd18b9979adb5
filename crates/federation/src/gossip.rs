//! Gossip Protocol Module
//!
//! This module interprets inbound protocol messages, applies them to the
//! shared ledger state, and pushes follow-up messages to other peers.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use acablock_protocol::{Message, MessageKind, ProtocolError};

use crate::node::JoinState;
use crate::storage::{LedgerStore, StorageError};
use crate::transport::{self, MessageHandler, TransportConfig, TransportError};

/// Errors raised while handling a gossip message
#[derive(Error, Debug)]
pub enum GossipError {
    #[error("Protocol error: {source}")]
    Protocol {
        #[from]
        source: ProtocolError,
    },

    #[error("Storage error: {source}")]
    Storage {
        #[from]
        source: StorageError,
    },

    #[error("Transport error: {source}")]
    Transport {
        #[from]
        source: TransportError,
    },
}

/// Statistics for monitoring gossip activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GossipStats {
    /// Messages decoded and dispatched
    pub messages_handled: u64,
    /// Undecodable lines dropped
    pub malformed_messages: u64,
    /// SET_BLOCKS chains refused by the replace policy
    pub chains_rejected: u64,
    /// ADD_BLOCK blocks that did not extend the tip
    pub blocks_rejected: u64,
    /// ADD_BLOCK blocks appended
    pub blocks_appended: u64,
    /// Outbound sends that failed
    pub sends_failed: u64,
}

#[derive(Debug, Default)]
struct GossipCounters {
    messages_handled: AtomicU64,
    malformed_messages: AtomicU64,
    chains_rejected: AtomicU64,
    blocks_rejected: AtomicU64,
    blocks_appended: AtomicU64,
    sends_failed: AtomicU64,
}

impl GossipCounters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> GossipStats {
        GossipStats {
            messages_handled: self.messages_handled.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
            chains_rejected: self.chains_rejected.load(Ordering::Relaxed),
            blocks_rejected: self.blocks_rejected.load(Ordering::Relaxed),
            blocks_appended: self.blocks_appended.load(Ordering::Relaxed),
            sends_failed: self.sends_failed.load(Ordering::Relaxed),
        }
    }
}

/// Send each message to its recipient concurrently.
///
/// At most one attempt per recipient; failures are logged and counted but do
/// not stop delivery to the others. Returns the number of failed sends.
pub async fn fan_out(deliveries: Vec<(String, Message)>, config: &TransportConfig) -> u64 {
    let mut tasks = JoinSet::new();
    for (addr, message) in deliveries {
        let config = config.clone();
        tasks.spawn(async move {
            let result = transport::send(&addr, &message, &config).await;
            (addr, message.kind, result)
        });
    }

    let mut failed = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, _, Ok(()))) => {}
            Ok((addr, kind, Err(e))) => {
                failed += 1;
                warn!(peer = %addr, ?kind, error = %e, "Gossip send failed");
            }
            Err(e) => {
                failed += 1;
                error!(error = %e, "Gossip send task aborted");
            }
        }
    }
    failed
}

/// Inbound message handler shared by every connection task
pub struct GossipHandler {
    /// Address this node advertises to peers
    local_addr: String,
    /// Shared chain and peer directory
    store: Arc<LedgerStore>,
    /// Settings for follow-up sends
    transport: TransportConfig,
    /// Join progress, completed by SET_BLOCKS
    join_state: Arc<watch::Sender<JoinState>>,
    counters: GossipCounters,
}

impl GossipHandler {
    pub fn new(
        local_addr: String,
        store: Arc<LedgerStore>,
        transport: TransportConfig,
        join_state: Arc<watch::Sender<JoinState>>,
    ) -> Self {
        Self {
            local_addr,
            store,
            transport,
            join_state,
            counters: GossipCounters::default(),
        }
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Get gossip statistics
    pub fn stats(&self) -> GossipStats {
        self.counters.snapshot()
    }

    pub(crate) fn record_send_failures(&self, failed: u64) {
        GossipCounters::bump(&self.counters.sends_failed, failed);
    }

    /// Admit a joining host and introduce it to the network
    async fn handle_new_host(&self, message: &Message) -> Result<(), GossipError> {
        let joiner = message.payload_addr()?;
        if joiner == self.local_addr {
            warn!(joiner, "Ignoring join request carrying our own address");
            return Ok(());
        }

        let existing = self.store.admit_peer(joiner).await;
        let local = self.local_addr.as_str();

        let mut deliveries = Vec::with_capacity(existing.len() + 1);
        deliveries.push((
            joiner.to_string(),
            Message::add_host(&existing.snapshot_for(joiner, &[local])),
        ));
        for peer in existing.snapshot() {
            let hosts = existing.snapshot_for(&peer, &[local, joiner]);
            deliveries.push((peer, Message::add_host(&hosts)));
        }

        info!(joiner, peers = existing.len(), "Admitted new host");
        let failed = fan_out(deliveries, &self.transport).await;
        self.record_send_failures(failed);
        Ok(())
    }

    /// Merge an announced host list into the directory
    async fn handle_add_host(&self, message: &Message) -> Result<(), GossipError> {
        let hosts = message.payload_hosts();
        let added = self.store.merge_peers(&hosts, &self.local_addr).await;
        debug!(received = hosts.len(), added, "Merged host list");
        Ok(())
    }

    /// Send the full chain to the requester
    async fn handle_new_block(&self, message: &Message) -> Result<(), GossipError> {
        let requester = message.payload_addr()?;
        let chain = self.store.chain().await;
        let reply = Message::set_blocks(&chain)?;

        if let Err(e) = transport::send(requester, &reply, &self.transport).await {
            self.record_send_failures(1);
            return Err(e.into());
        }
        debug!(requester, blocks = chain.len(), "Sent chain");
        Ok(())
    }

    /// Replace the local chain and complete a pending join
    async fn handle_set_blocks(&self, message: &Message) -> Result<(), GossipError> {
        let candidate = message.payload_blocks()?;
        let len = match self.store.replace_chain(candidate).await {
            Ok(len) => len,
            Err(e) => {
                GossipCounters::bump(&self.counters.chains_rejected, 1);
                return Err(e.into());
            }
        };
        info!(blocks = len, "Replaced local chain");

        let completed = self.join_state.send_if_modified(|state| {
            if *state == JoinState::Joining {
                *state = JoinState::Joined;
                true
            } else {
                false
            }
        });
        if completed {
            debug!("Chain sync completed join");
        }
        Ok(())
    }

    /// Append a replicated block
    async fn handle_add_block(&self, message: &Message) -> Result<(), GossipError> {
        let block = message.payload_block()?;
        match self.store.push_block(block).await {
            Ok(index) => {
                GossipCounters::bump(&self.counters.blocks_appended, 1);
                debug!(index, "Appended replicated block");
                Ok(())
            }
            Err(e) => {
                GossipCounters::bump(&self.counters.blocks_rejected, 1);
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl MessageHandler for GossipHandler {
    type Error = GossipError;

    async fn handle(&self, message: Message) -> Result<Option<Message>, GossipError> {
        GossipCounters::bump(&self.counters.messages_handled, 1);
        debug!(kind = ?message.kind, "Handling gossip message");

        match message.kind {
            MessageKind::NewHost => self.handle_new_host(&message).await?,
            MessageKind::AddHost => self.handle_add_host(&message).await?,
            MessageKind::NewBlock => self.handle_new_block(&message).await?,
            MessageKind::SetBlocks => self.handle_set_blocks(&message).await?,
            MessageKind::AddBlock => self.handle_add_block(&message).await?,
        }
        // every reply travels on a separate connection
        Ok(None)
    }

    fn malformed(&self, peer: SocketAddr, error: &ProtocolError) {
        GossipCounters::bump(&self.counters.malformed_messages, 1);
        warn!(%peer, error = %error, "Dropping malformed message");
    }
}
