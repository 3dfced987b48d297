//! The sparse chapter cache.
//!
//! Chapters inside the sparse window index only sampled names in the master
//! index; everything else in them is reachable only through this cache. A
//! chapter enters the cache when a barrier message for it executes, and
//! leaves either by capacity eviction or when it expires from the chapter
//! ring.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::mem;

use parking_lot::Mutex;

use crate::error::Result;
use crate::geometry::Geometry;
use crate::record::{ChunkData, ChunkName, ChunkRecord};
use crate::volume::Volume;

/// Chapter hint that searches every cached chapter.
pub const SEARCH_ALL_CHAPTERS: u64 = u64::MAX;

/// Orders a sparse-cache mutation ahead of the request that needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierMessage {
    /// The sparse chapter to cache.
    pub virtual_chapter: u64,
}

struct CachedChapter {
    vcn: u64,
    records: HashMap<ChunkName, ChunkData>,
}

/// Bounded cache of sparse chapter contents.
pub struct SparseCache {
    capacity: usize,
    chapters: Mutex<VecDeque<CachedChapter>>,
}

impl SparseCache {
    /// Create a cache holding at most `capacity` chapters.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            chapters: Mutex::new(VecDeque::new()),
        }
    }

    /// Whether a chapter is currently cached.
    pub fn contains(&self, vcn: u64) -> bool {
        self.chapters.lock().iter().any(|cached| cached.vcn == vcn)
    }

    /// Search for `name`, either in one cached chapter or (with
    /// [`SEARCH_ALL_CHAPTERS`]) across the whole cache.
    pub fn search(&self, name: &ChunkName, chapter_hint: u64) -> Option<ChunkData> {
        let chapters = self.chapters.lock();
        if chapter_hint == SEARCH_ALL_CHAPTERS {
            chapters
                .iter()
                .find_map(|cached| cached.records.get(name).copied())
        } else {
            chapters
                .iter()
                .find(|cached| cached.vcn == chapter_hint)
                .and_then(|cached| cached.records.get(name).copied())
        }
    }

    /// Execute a barrier: make sure the named chapter is cached, reading its
    /// record pages from the volume if it is not.
    pub fn execute_barrier<V: Volume>(
        &self,
        volume: &V,
        geometry: &Geometry,
        barrier: BarrierMessage,
    ) -> Result<()> {
        let vcn = barrier.virtual_chapter;
        if self.contains(vcn) {
            return Ok(());
        }

        let physical = geometry.map_to_physical_chapter(vcn);
        let mut records = HashMap::new();
        let first_record_page = geometry.index_pages_per_chapter;
        for page in first_record_page..geometry.pages_per_chapter() {
            for ChunkRecord { name, data } in volume.get_record_page(physical, page)? {
                records.insert(name, data);
            }
        }

        let mut chapters = self.chapters.lock();
        // Re-check under the lock; another zone may have raced us here.
        if chapters.iter().any(|cached| cached.vcn == vcn) {
            return Ok(());
        }
        while chapters.len() >= self.capacity {
            if let Some(evicted) = chapters.pop_front() {
                tracing::debug!(vcn = evicted.vcn, "evicted sparse chapter");
            }
        }
        chapters.push_back(CachedChapter { vcn, records });
        tracing::debug!(vcn, "cached sparse chapter");
        Ok(())
    }

    /// Drop a chapter that expired from the ring.
    pub fn forget_chapter(&self, vcn: u64) {
        self.chapters.lock().retain(|cached| cached.vcn != vcn);
    }

    /// Rough bytes held by cached chapters.
    pub fn memory_allocated(&self) -> u64 {
        let chapters = self.chapters.lock();
        chapters
            .iter()
            .map(|cached| cached.records.len() * mem::size_of::<ChunkRecord>())
            .sum::<usize>() as u64
    }
}
