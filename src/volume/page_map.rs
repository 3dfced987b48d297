//! The index-page map.
//!
//! Records, for every index page of every physical chapter, the highest
//! delta list that page summarizes. The map is rebuilt during replay and
//! persisted as a state component; `last_update` is a sequence number that
//! lets the replay driver notice whether it changed anything.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::Result;

/// One page's slot in the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMapEntry {
    /// The virtual chapter the physical slot held when this page was mapped.
    pub virtual_chapter: u64,
    /// The highest delta list summarized by the page.
    pub highest_list: u32,
}

/// Map from (physical chapter, index page) to delta-list coverage.
#[derive(Debug, Default)]
pub struct IndexPageMap {
    entries: RwLock<HashMap<(u32, u32), PageMapEntry>>,
    last_update: AtomicU64,
}

impl IndexPageMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the coverage of one index page.
    pub fn update(
        &self,
        virtual_chapter: u64,
        physical_chapter: u32,
        index_page: u32,
        highest_list: u32,
    ) -> Result<()> {
        let mut entries = self.entries.write();
        entries.insert(
            (physical_chapter, index_page),
            PageMapEntry {
                virtual_chapter,
                highest_list,
            },
        );
        self.last_update.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Look up one page's coverage.
    pub fn get(&self, physical_chapter: u32, index_page: u32) -> Option<PageMapEntry> {
        self.entries.read().get(&(physical_chapter, index_page)).copied()
    }

    /// The update sequence number.
    pub fn last_update(&self) -> u64 {
        self.last_update.load(Ordering::Relaxed)
    }

    /// Number of mapped pages.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot the map for the state store.
    pub(crate) fn export_entries(&self) -> (u64, Vec<(u32, u32, PageMapEntry)>) {
        let entries = self.entries.read();
        let mut out: Vec<_> = entries
            .iter()
            .map(|(&(chapter, page), &entry)| (chapter, page, entry))
            .collect();
        out.sort_by_key(|&(chapter, page, _)| (chapter, page));
        (self.last_update.load(Ordering::Relaxed), out)
    }

    /// Replace the map from the state store.
    pub(crate) fn import_entries(
        &self,
        last_update: u64,
        imported: Vec<(u32, u32, PageMapEntry)>,
    ) {
        let mut entries = self.entries.write();
        entries.clear();
        for (chapter, page, entry) in imported {
            entries.insert((chapter, page), entry);
        }
        self.last_update.store(last_update, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_and_get() {
        let map = IndexPageMap::new();
        assert!(map.is_empty());
        map.update(12, 2, 0, 3).unwrap();
        map.update(12, 2, 1, 7).unwrap();

        assert_eq!(
            map.get(2, 1),
            Some(PageMapEntry {
                virtual_chapter: 12,
                highest_list: 7
            })
        );
        assert_eq!(map.get(3, 0), None);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_last_update_advances() {
        let map = IndexPageMap::new();
        let before = map.last_update();
        map.update(0, 0, 0, 1).unwrap();
        assert!(map.last_update() > before);
    }

    #[test]
    fn test_export_import() {
        let map = IndexPageMap::new();
        map.update(5, 5, 0, 3).unwrap();
        map.update(6, 6, 0, 3).unwrap();
        let (seq, entries) = map.export_entries();

        let restored = IndexPageMap::new();
        restored.import_entries(seq, entries);
        assert_eq!(restored.last_update(), seq);
        assert_eq!(restored.get(5, 0).unwrap().virtual_chapter, 5);
        assert_eq!(restored.get(6, 0).unwrap().highest_list, 3);
    }
}
