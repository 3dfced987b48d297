//! Read-only statistics aggregated across the index's collaborators.

/// Point-in-time counters for one index.
///
/// Produced by [`crate::index::DedupIndex::get_stats`]; safe to gather from
/// any thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Entries currently held by the master index.
    pub entries_indexed: u64,
    /// Approximate bytes used by the master index, sparse cache, volume
    /// cache, and chapter writer together.
    pub memory_used: u64,
    /// Collision records currently held by the master index.
    pub collisions: u64,
    /// Entries the master index has expired out of the chapter ring.
    pub entries_discarded: u64,
    /// Saves completed since the index was built.
    pub checkpoints: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_zeroed() {
        let stats = IndexStats::default();
        assert_eq!(stats.entries_indexed, 0);
        assert_eq!(stats.memory_used, 0);
        assert_eq!(stats.checkpoints, 0);
    }
}
