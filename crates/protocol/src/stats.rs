//! Chain summary for operators.

use crate::ledger::Chain;

/// Chain statistics for monitoring and observability.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChainStats {
    /// Total number of blocks, genesis included
    pub total_blocks: usize,
    /// Number of non-genesis records
    pub record_count: usize,
    /// Hash of the tip
    pub latest_hash: String,
    /// Genesis timestamp
    pub earliest_timestamp: Option<String>,
    /// Tip timestamp
    pub latest_timestamp: Option<String>,
}

impl ChainStats {
    pub fn from_chain(chain: &Chain) -> Self {
        let blocks = chain.blocks();
        Self {
            total_blocks: blocks.len(),
            record_count: blocks.len().saturating_sub(1),
            latest_hash: blocks.last().map(|b| b.hash.clone()).unwrap_or_default(),
            earliest_timestamp: blocks.first().map(|b| b.timestamp.to_rfc3339()),
            latest_timestamp: blocks.last().map(|b| b.timestamp.to_rfc3339()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Record;

    #[test]
    fn test_stats_track_chain() {
        let mut chain = Chain::new();
        let genesis = ChainStats::from_chain(&chain);
        assert_eq!(genesis.total_blocks, 1);
        assert_eq!(genesis.record_count, 0);
        assert_eq!(genesis.earliest_timestamp, genesis.latest_timestamp);

        chain.append(Record::default());
        let stats = ChainStats::from_chain(&chain);
        assert_eq!(stats.total_blocks, 2);
        assert_eq!(stats.record_count, 1);
        assert_eq!(stats.latest_hash, chain.latest().hash);
    }
}
