//! Peer Directory
//!
//! The set of `host:port` addresses a node knows about. The node's own
//! address is never stored here; callers add it to outgoing host lists.

use std::collections::BTreeSet;

/// Separator used in host-list payloads.
const HOST_SEPARATOR: &str = ",";

/// Known peer addresses, keyed by the exact address string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerDirectory {
    peers: BTreeSet<String>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer. Returns `false` if it was already known.
    pub fn add_peer(&mut self, addr: &str) -> bool {
        if addr.is_empty() {
            return false;
        }
        self.peers.insert(addr.to_string())
    }

    /// Remove a peer. Returns `false` if it was not known.
    pub fn remove(&mut self, addr: &str) -> bool {
        self.peers.remove(addr)
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.peers.contains(addr)
    }

    /// Add every address except `local_addr`, returning how many were new.
    pub fn merge<'a, I>(&mut self, addrs: I, local_addr: &str) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        addrs
            .into_iter()
            .filter(|addr| *addr != local_addr)
            .filter(|addr| self.add_peer(addr))
            .count()
    }

    /// Replace the directory wholesale, still skipping `local_addr`.
    pub fn replace_all<'a, I>(&mut self, addrs: I, local_addr: &str)
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.peers.clear();
        self.merge(addrs, local_addr);
    }

    /// Current members.
    pub fn snapshot(&self) -> Vec<String> {
        self.peers.iter().cloned().collect()
    }

    /// Members plus `extra`, minus `recipient`: the host list sent to `recipient`.
    pub fn snapshot_for(&self, recipient: &str, extra: &[&str]) -> Vec<String> {
        let mut hosts: BTreeSet<&str> = self.peers.iter().map(String::as_str).collect();
        hosts.extend(extra.iter().copied().filter(|addr| !addr.is_empty()));
        hosts.remove(recipient);
        hosts.into_iter().map(str::to_string).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Split a comma-joined host list, dropping blank entries.
pub fn parse_host_list(payload: &str) -> Vec<String> {
    payload
        .split(HOST_SEPARATOR)
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(str::to_string)
        .collect()
}

/// Join addresses into a host-list payload.
pub fn join_host_list<S: AsRef<str>>(hosts: &[S]) -> String {
    hosts
        .iter()
        .map(|host| host.as_ref())
        .collect::<Vec<&str>>()
        .join(HOST_SEPARATOR)
}
