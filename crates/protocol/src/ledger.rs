//! Ledger Model
//!
//! Records, blocks and the hash-linked chain every node keeps a copy of.
//! Block hashes are BLAKE3 digests over a length-prefixed encoding of the
//! block header, so any change to a stored block is detectable.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;

/// `previous_hash` carried by every genesis block.
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Domain tag mixed into every block hash.
const BLOCK_HASH_DOMAIN: &[u8] = b"ACABLOCK_BLOCK_V1";

/// One academic entry stored in the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Student name
    pub name: String,
    /// Academic year
    pub year: String,
    /// University issuing the grade
    pub university: String,
    /// Course name
    pub course: String,
    /// Teacher of the course
    pub teacher: String,
    /// Final grade
    pub grade: String,
}

/// A single block of the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Position in the chain, 0 for genesis
    pub index: u64,
    /// Creation time on the node that appended it
    pub timestamp: DateTime<Utc>,
    /// Record carried by this block
    pub data: Record,
    /// Hash of the preceding block
    pub previous_hash: String,
    /// Hash of this block's header
    pub hash: String,
}

impl Block {
    /// Create the genesis block: index 0, empty record, sentinel back-link.
    pub fn genesis() -> Self {
        Self::sealed(0, Utc::now(), Record::default(), GENESIS_PREVIOUS_HASH.to_string())
    }

    /// Build a block and compute its hash.
    pub fn sealed(
        index: u64,
        timestamp: DateTime<Utc>,
        data: Record,
        previous_hash: String,
    ) -> Self {
        let mut block = Block {
            index,
            timestamp,
            data,
            previous_hash,
            hash: String::new(),
        };
        block.hash = block.calculate_hash();
        block
    }

    /// Recompute the hash from the block's header fields.
    pub fn calculate_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(BLOCK_HASH_DOMAIN);
        hasher.update(&self.index.to_le_bytes());
        update_field(
            &mut hasher,
            &self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
        );
        for field in [
            &self.data.name,
            &self.data.year,
            &self.data.university,
            &self.data.course,
            &self.data.teacher,
            &self.data.grade,
        ] {
            update_field(&mut hasher, field);
        }
        update_field(&mut hasher, &self.previous_hash);
        hasher.finalize().to_hex().to_string()
    }

    /// Whether the stored hash matches the header.
    pub fn has_valid_hash(&self) -> bool {
        self.hash == self.calculate_hash()
    }

    /// Whether this block directly extends `previous`.
    pub fn extends(&self, previous: &Block) -> bool {
        previous.index.checked_add(1) == Some(self.index) && self.previous_hash == previous.hash
    }

    /// Whether this is a well-formed genesis block.
    pub fn is_genesis(&self) -> bool {
        self.index == 0 && self.previous_hash == GENESIS_PREVIOUS_HASH && self.has_valid_hash()
    }
}

// Length prefix keeps adjacent fields from sliding into each other.
fn update_field(hasher: &mut blake3::Hasher, value: &str) {
    hasher.update(&(value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

/// Check hash, back-link and index of every block after the first.
///
/// Chains of length 0 or 1 are trivially valid.
pub fn is_valid_chain(blocks: &[Block]) -> bool {
    first_invalid_index(blocks).is_none()
}

fn first_invalid_index(blocks: &[Block]) -> Option<usize> {
    blocks
        .windows(2)
        .position(|pair| !pair[1].has_valid_hash() || !pair[1].extends(&pair[0]))
        .map(|i| i + 1)
}

/// Append-only, hash-linked sequence of blocks starting at genesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Chain {
    blocks: Vec<Block>,
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}

impl Chain {
    /// Create a chain holding a fresh genesis block.
    pub fn new() -> Self {
        Self {
            blocks: vec![Block::genesis()],
        }
    }

    /// Most recent block.
    pub fn latest(&self) -> &Block {
        // never empty: constructed with genesis and replaced only by non-empty candidates
        &self.blocks[self.blocks.len() - 1]
    }

    /// Append a record as a new block linked to the current tip.
    pub fn append(&mut self, record: Record) -> &Block {
        // indices run 0..len from genesis, so the increment cannot overflow
        let latest = self.latest();
        let block = Block::sealed(latest.index + 1, Utc::now(), record, latest.hash.clone());
        self.blocks.push(block);
        self.latest()
    }

    /// Append a block received from a peer.
    ///
    /// Only the new block is checked against the current tip; the rest of the
    /// chain is not re-validated.
    pub fn push_block(&mut self, block: Block) -> Result<(), ProtocolError> {
        let latest = self.latest();
        if !block.extends(latest) {
            return Err(ProtocolError::rejected(format!(
                "block {} does not extend tip {} ({})",
                block.index, latest.index, latest.hash
            )));
        }
        if !block.has_valid_hash() {
            return Err(ProtocolError::rejected(format!(
                "block {} hash mismatch",
                block.index
            )));
        }
        self.blocks.push(block);
        Ok(())
    }

    /// Replace the whole chain with a peer-supplied candidate.
    ///
    /// The candidate must start at a genesis block, be valid, and be no
    /// shorter than the local chain.
    pub fn replace(&mut self, candidate: Vec<Block>) -> Result<(), ProtocolError> {
        match candidate.first() {
            None => return Err(ProtocolError::rejected("empty candidate")),
            Some(first) if !first.is_genesis() => {
                return Err(ProtocolError::rejected(format!(
                    "candidate starts at index {} without a genesis block",
                    first.index
                )))
            }
            Some(_) => {}
        }
        if candidate.len() < self.blocks.len() {
            return Err(ProtocolError::rejected(format!(
                "candidate of length {} is shorter than local chain of length {}",
                candidate.len(),
                self.blocks.len()
            )));
        }
        if let Some(index) = first_invalid_index(&candidate) {
            return Err(ProtocolError::rejected(format!(
                "invalid hash or linkage at index {}",
                index
            )));
        }
        self.blocks = candidate;
        Ok(())
    }

    /// Whether the chain passes hash and linkage checks.
    pub fn is_valid(&self) -> bool {
        is_valid_chain(&self.blocks)
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Records of every block except genesis.
    pub fn records(&self) -> Vec<Record> {
        self.blocks.iter().skip(1).map(|b| b.data.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
